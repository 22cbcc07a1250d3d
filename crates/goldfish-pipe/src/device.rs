//! Device attach, pipe open, and interrupt handling.
//!
//! The top half ([`PipeDevice::interrupt`]) runs in the caller's context, only
//! touches the signal queue under the device lock, and hands off to a
//! dedicated bottom-half thread. The bottom half drains the queue one pipe at
//! a time and wakes blocked callers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::command::CommandChannel;
use crate::config::PipeDeviceConfig;
use crate::error::{InitError, PipeError, Result};
use crate::hal::{GuestMemory, PageAllocator, Platform, RegisterWindow};
use crate::layout::{
    dev_buf, reg, status, HostWakeFlags, PipeCommand, PIPE_CURRENT_DEVICE_VERSION,
};
use crate::pipe::{Pipe, PipeShared};
use crate::sg::ScatterGatherMapper;
use crate::signal::SignalQueue;
use crate::table::PipeTable;
use crate::wait::WaitFlags;

/// Result of the interrupt top half.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    /// The host reported no signalled pipes; the interrupt was not ours.
    None,
    Handled,
}

/// Everything guarded by the device lock.
pub(crate) struct DeviceState {
    pub(crate) pipes: PipeTable<Arc<PipeShared>>,
    pub(crate) signals: SignalQueue,
}

#[derive(Debug, Default)]
struct BottomHalfState {
    scheduled: bool,
    shutdown: bool,
}

/// Scheduling handshake with the worker thread. Scheduling an already
/// pending run is a no-op.
#[derive(Debug, Default)]
struct BottomHalf {
    state: Mutex<BottomHalfState>,
    cond: Condvar,
}

impl BottomHalf {
    fn lock(&self) -> MutexGuard<'_, BottomHalfState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self) {
        let mut state = self.lock();
        if !state.scheduled {
            state.scheduled = true;
            self.cond.notify_one();
        }
    }

    fn shutdown(&self) {
        self.lock().shutdown = true;
        self.cond.notify_all();
    }

    /// Blocks until a run is scheduled. Returns `false` on shutdown.
    fn wait_for_work(&self) -> bool {
        let mut state = self.lock();
        loop {
            if state.shutdown {
                return false;
            }
            if state.scheduled {
                state.scheduled = false;
                return true;
            }
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

pub(crate) struct DeviceCore {
    pub(crate) config: PipeDeviceConfig,
    pub(crate) channel: CommandChannel,
    pub(crate) mapper: ScatterGatherMapper,
    pub(crate) allocator: Arc<dyn PageAllocator>,
    registers: Arc<dyn RegisterWindow>,
    memory: Arc<dyn GuestMemory>,
    state: Mutex<DeviceState>,
    bottom_half: BottomHalf,
    shared_page: u64,
    host_version: u32,
    dma_alloc_total: AtomicU64,
    detached: AtomicBool,
}

impl DeviceCore {
    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    pub(crate) fn add_dma_alloc(&self, size: u64) -> u64 {
        self.dma_alloc_total.fetch_add(size, Ordering::AcqRel) + size
    }

    pub(crate) fn sub_dma_alloc(&self, size: u64) -> u64 {
        self.dma_alloc_total
            .fetch_sub(size, Ordering::AcqRel)
            .saturating_sub(size)
    }

    fn top_half(&self) -> IrqReturn {
        let mut state = self.lock_state();
        let reported = self.registers.read_u32(reg::GET_SIGNALLED) as usize;
        if reported == 0 {
            return IrqReturn::None;
        }
        let count = reported.min(self.config.max_signalled_pipes);
        if count < reported {
            warn!(reported, count, "host reported more signalled pipes than the buffer holds");
        }

        let DeviceState { pipes, signals } = &mut *state;
        for i in 0..count {
            let id = self
                .memory
                .read_u32(self.shared_page + dev_buf::signalled_id(i));
            let flags = HostWakeFlags::from_bits_truncate(
                self.memory
                    .read_u32(self.shared_page + dev_buf::signalled_flags(i)),
            );
            if !signals.add(pipes, id, flags) {
                warn!(pipe = id, ?flags, "dropping signal for unknown pipe");
            }
        }
        drop(state);

        trace!(count, "scheduling bottom half");
        self.bottom_half.schedule();
        IrqReturn::Handled
    }

    fn bottom_half(&self) {
        loop {
            let popped = {
                let mut state = self.lock_state();
                let DeviceState { pipes, signals } = &mut *state;
                signals.pop_front(pipes)
            };
            let Some((id, pipe, wakes)) = popped else {
                return;
            };

            if pipe.is_closing() {
                // Close already unlinked the rest of its state.
                debug!(pipe = id, "signalled pipe is closing; ending drain");
                return;
            }

            trace!(pipe = id, ?wakes, "delivering host signal");
            if wakes.contains(HostWakeFlags::CLOSED) {
                pipe.flags.store(WaitFlags::CLOSED_ON_HOST);
            } else {
                if wakes.contains(HostWakeFlags::READ) {
                    pipe.flags.remove(WaitFlags::WAKE_ON_READ);
                }
                if wakes.contains(HostWakeFlags::WRITE) {
                    pipe.flags.remove(WaitFlags::WAKE_ON_WRITE);
                }
                if wakes.contains(HostWakeFlags::UNLOCK_DMA) {
                    pipe.dma_clear_lock();
                }
            }
            pipe.wake.wake_all();
        }
    }

    fn run_bottom_half_worker(self: Arc<Self>) {
        while self.bottom_half.wait_for_work() {
            self.bottom_half();
        }
        debug!("bottom half stopped");
    }
}

/// An attached pipe device.
///
/// Dropping the device stops the bottom half and forgets every registered
/// pipe. Pipes still held by callers afterwards fail their commands with an
/// I/O error.
pub struct PipeDevice {
    core: Arc<DeviceCore>,
    worker: Option<JoinHandle<()>>,
}

impl PipeDevice {
    /// Performs the version handshake, publishes the shared page to the host
    /// and starts the bottom-half worker.
    pub fn init(platform: Platform, config: PipeDeviceConfig) -> Result<Self, InitError> {
        config.validate()?;
        let Platform {
            registers,
            memory,
            allocator,
        } = platform;

        registers.write_u32(reg::VERSION, config.driver_version);
        let host_version = registers.read_u32(reg::VERSION);
        if host_version < PIPE_CURRENT_DEVICE_VERSION {
            error!(
                host_version,
                required = PIPE_CURRENT_DEVICE_VERSION,
                "host pipe device is too old"
            );
            return Err(InitError::UnsupportedDeviceVersion {
                host: host_version,
                required: PIPE_CURRENT_DEVICE_VERSION,
            });
        }

        let pipes = PipeTable::with_capacity(config.initial_pipes_capacity)
            .map_err(|_| InitError::OutOfMemory)?;
        let shared_page = allocator.alloc_pages(1).ok_or(InitError::OutOfMemory)?;

        let signal_paddr = shared_page + dev_buf::SIGNALLED;
        registers.write_u32(reg::SIGNAL_BUFFER_HIGH, (signal_paddr >> 32) as u32);
        registers.write_u32(reg::SIGNAL_BUFFER, signal_paddr as u32);
        registers.write_u32(reg::SIGNAL_BUFFER_COUNT, config.max_signalled_pipes as u32);

        let open_paddr = shared_page + dev_buf::OPEN_COMMAND_BUFFER_PTR;
        registers.write_u32(reg::OPEN_BUFFER_HIGH, (open_paddr >> 32) as u32);
        registers.write_u32(reg::OPEN_BUFFER, open_paddr as u32);

        let thread_name = config.bottom_half_thread_name.clone();
        let core = Arc::new(DeviceCore {
            channel: CommandChannel::new(registers.clone(), memory.clone()),
            mapper: ScatterGatherMapper::new(config.max_buffers_per_command),
            config,
            allocator: allocator.clone(),
            registers,
            memory,
            state: Mutex::new(DeviceState {
                pipes,
                signals: SignalQueue::new(),
            }),
            bottom_half: BottomHalf::default(),
            shared_page,
            host_version,
            dma_alloc_total: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });

        let worker_core = core.clone();
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || worker_core.run_bottom_half_worker())
            .map_err(|err| {
                error!(%err, "could not spawn bottom half");
                allocator.free_pages(shared_page, 1);
                InitError::SpawnBottomHalf(err)
            })?;

        info!(host_version, "goldfish pipe device attached");
        Ok(Self {
            core,
            worker: Some(worker),
        })
    }

    /// Opens a new pipe, registering it with the host.
    pub fn open(&self) -> Result<Pipe> {
        let core = &self.core;
        if core.is_detached() {
            return Err(PipeError::Io);
        }

        let command_paddr = core.allocator.alloc_pages(1).ok_or_else(|| {
            error!("could not allocate pipe command buffer");
            PipeError::OutOfMemory
        })?;

        let mut state = core.lock_state();
        let id = match state.pipes.alloc_id() {
            Ok(id) => id,
            Err(err) => {
                drop(state);
                error!(%err, "pipe table is full");
                core.allocator.free_pages(command_paddr, 1);
                return Err(err);
            }
        };
        let shared = Arc::new(PipeShared::new(id, core.clone(), command_paddr));
        state.pipes.insert(id, shared.clone());

        core.memory.write_u32(
            core.shared_page + dev_buf::OPEN_RW_PARAMS_MAX_COUNT,
            core.config.max_buffers_per_command as u32,
        );
        core.memory
            .write_u64(core.shared_page + dev_buf::OPEN_COMMAND_BUFFER_PTR, command_paddr);
        let status = match shared.lock.try_lock() {
            Some(guard) => shared.command_locked(&guard, PipeCommand::Open),
            None => status::ERROR_IO,
        };

        if status < 0 {
            state.pipes.remove(id);
            drop(state);
            error!(pipe = id, status, "host refused to open pipe");
            core.allocator.free_pages(command_paddr, 1);
            return Err(PipeError::from_host_status(status));
        }
        drop(state);

        debug!(pipe = id, "pipe opened");
        Ok(Pipe::new(shared))
    }

    /// Interrupt top half. Call whenever the device raises its interrupt.
    pub fn interrupt(&self) -> IrqReturn {
        self.core.top_half()
    }

    pub fn host_version(&self) -> u32 {
        self.core.host_version
    }

    pub fn config(&self) -> &PipeDeviceConfig {
        &self.core.config
    }

    /// Bytes currently allocated for DMA regions across all pipes.
    pub fn dma_alloc_total(&self) -> u64 {
        self.core.dma_alloc_total.load(Ordering::Acquire)
    }

    pub fn open_pipes(&self) -> usize {
        self.core.lock_state().pipes.len()
    }

    pub fn pipe_capacity(&self) -> usize {
        self.core.lock_state().pipes.capacity()
    }

    /// Detaches from the host. Equivalent to dropping the device.
    pub fn deinit(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        self.core.detached.store(true, Ordering::Release);
        self.core.bottom_half.shutdown();
        if worker.join().is_err() {
            error!("bottom half panicked");
        }

        let orphaned = {
            let mut state = self.core.lock_state();
            if !state.signals.is_empty() {
                debug!("dropping undelivered host signals");
            }
            state.signals = SignalQueue::new();
            state.pipes.drain()
        };
        if !orphaned.is_empty() {
            warn!(count = orphaned.len(), "detaching with pipes still open");
        }
        // No bottom half is left to clear want-bits, so release every waiter.
        for pipe in orphaned {
            pipe.flags.store(WaitFlags::CLOSED_ON_HOST);
            pipe.wake.wake_all();
        }

        self.core.allocator.free_pages(self.core.shared_page, 1);
        info!("goldfish pipe device detached");
    }
}

impl Drop for PipeDevice {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PipeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeDevice")
            .field("host_version", &self.core.host_version)
            .field("dma_alloc_total", &self.dma_alloc_total())
            .finish_non_exhaustive()
    }
}
