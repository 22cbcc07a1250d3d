//! Per-pipe state and the caller-facing pipe handle.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bitflags::bitflags;
use tracing::{debug, info};

use crate::device::{DeviceCore, DeviceState};
use crate::dma::{DmaContext, DmaControl, DmaControlReply};
use crate::error::{PipeError, Result};
use crate::hal::{AddressSpace, UserMapping};
use crate::layout::{status, HostPollFlags, PipeCommand};
use crate::sg::Direction;
use crate::wait::{
    AtomicWaitFlags, CancelToken, CommandLock, CommandLockGuard, WaitFlags, WaitQueue,
};

bitflags! {
    /// Readiness reported by [`Pipe::poll`], using the Linux `POLL*` values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PollMask: u32 {
        const IN = 0x0001;
        const OUT = 0x0004;
        const ERR = 0x0008;
        const HUP = 0x0010;
        const RDNORM = 0x0040;
        const WRNORM = 0x0100;
    }
}

/// Lifecycle of a pipe as seen by the interrupt path.
///
/// A pipe is reachable from the table and the signal queue only while
/// `Open` or `Closing`; its memory is reclaimed after `Unlinked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipeState {
    Open = 0,
    Closing = 1,
    Unlinked = 2,
}

/// Per-call options for [`Pipe::read`] and [`Pipe::write`].
#[derive(Debug, Clone, Default)]
pub struct IoOptions {
    /// Surface "try again" as [`PipeError::WouldBlock`] instead of waiting.
    pub nonblocking: bool,
    pub cancel: CancelToken,
}

impl IoOptions {
    pub fn blocking() -> Self {
        Self::default()
    }

    pub fn nonblocking() -> Self {
        Self {
            nonblocking: true,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

pub(crate) struct PipeShared {
    pub(crate) id: u32,
    pub(crate) core: Arc<DeviceCore>,
    pub(crate) command_paddr: u64,
    /// Wake-wants plus the sticky host-closed bit; written by callers and the
    /// bottom half without a shared lock.
    pub(crate) flags: AtomicWaitFlags,
    pub(crate) wake: Arc<WaitQueue>,
    /// Serializes every use of the command buffer.
    pub(crate) lock: CommandLock,
    pub(crate) dma: Mutex<Option<Arc<DmaContext>>>,
    state: AtomicU8,
}

impl PipeShared {
    pub(crate) fn new(id: u32, core: Arc<DeviceCore>, command_paddr: u64) -> Self {
        Self {
            id,
            core,
            command_paddr,
            flags: AtomicWaitFlags::default(),
            wake: Arc::new(WaitQueue::new()),
            lock: CommandLock::new(),
            dma: Mutex::new(None),
            state: AtomicU8::new(PipeState::Open as u8),
        }
    }

    pub(crate) fn state(&self) -> PipeState {
        match self.state.load(Ordering::Acquire) {
            0 => PipeState::Open,
            1 => PipeState::Closing,
            _ => PipeState::Unlinked,
        }
    }

    fn set_state(&self, state: PipeState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.state() != PipeState::Open
    }

    pub(crate) fn dma_slot(&self) -> MutexGuard<'_, Option<Arc<DmaContext>>> {
        self.dma.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn command_locked(&self, guard: &CommandLockGuard<'_>, cmd: PipeCommand) -> i32 {
        if self.core.is_detached() {
            return status::ERROR_IO;
        }
        self.core
            .channel
            .execute(guard, self.command_paddr, self.id, cmd)
    }

    /// Runs a parameterless command. Cancellation while waiting for the
    /// command lock reads as an I/O error status.
    pub(crate) fn command(&self, cmd: PipeCommand, cancel: &CancelToken) -> i32 {
        match self.lock.lock_interruptible(cancel) {
            Ok(guard) => self.command_locked(&guard, cmd),
            Err(_) => status::ERROR_IO,
        }
    }

    /// Pins, sends and unpins one chunk. Returns `(status, consumed_size)`.
    fn transfer_max_buffers(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        address_end: u64,
        direction: Direction,
        cancel: &CancelToken,
    ) -> Result<(i32, i32)> {
        let chunk = self
            .core
            .mapper
            .map_and_merge(space, address, address_end, direction)?;

        let guard = self
            .lock
            .lock_interruptible(cancel)
            .map_err(|_| PipeError::Interrupted)?;
        let buffer = self.core.channel.buffer(self.command_paddr);
        buffer.set_rw_buffers(chunk.descriptors());
        let cmd = match direction {
            Direction::Read => PipeCommand::Read,
            Direction::Write => PipeCommand::Write,
        };
        let status = self.command_locked(&guard, cmd);
        let consumed = buffer.consumed_size();
        drop(guard);

        chunk.release(consumed);
        Ok((status, consumed))
    }

    pub(crate) fn transfer(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        direction: Direction,
        options: &IoOptions,
    ) -> Result<usize> {
        if self.flags.contains(WaitFlags::CLOSED_ON_HOST) {
            return Err(PipeError::Io);
        }
        if len == 0 {
            return Ok(0);
        }
        if !space.is_range_accessible(address, len) {
            return Err(PipeError::Fault);
        }
        let address_end = address
            .checked_add(len as u64)
            .ok_or(PipeError::Fault)?;

        let mut address = address;
        let mut count = 0usize;
        let mut outcome = Ok(());
        while address < address_end {
            let (status, consumed) = match self.transfer_max_buffers(
                space,
                address,
                address_end,
                direction,
                &options.cancel,
            ) {
                Ok(result) => result,
                Err(err) => {
                    outcome = Err(err);
                    break;
                }
            };

            if consumed > 0 {
                let consumed = (consumed as u64).min(address_end - address);
                count += consumed as usize;
                address += consumed;
            }
            if status > 0 {
                continue;
            }
            if status == 0 {
                // End of stream.
                break;
            }
            if count > 0 {
                if status != status::ERROR_AGAIN {
                    info!(
                        pipe = self.id,
                        status,
                        ?direction,
                        transferred = count,
                        "backend error after partial transfer"
                    );
                }
                break;
            }
            if status != status::ERROR_AGAIN || options.nonblocking {
                outcome = Err(PipeError::from_host_status(status));
                break;
            }

            self.wait_for_host_signal(direction, &options.cancel)?;
        }

        if count > 0 {
            return Ok(count);
        }
        outcome.map(|()| 0)
    }

    fn wait_for_host_signal(&self, direction: Direction, cancel: &CancelToken) -> Result<()> {
        let (bit, cmd) = match direction {
            Direction::Read => (WaitFlags::WAKE_ON_READ, PipeCommand::WakeOnRead),
            Direction::Write => (WaitFlags::WAKE_ON_WRITE, PipeCommand::WakeOnWrite),
        };
        self.flags.insert(bit);

        // Arm the host notification; a failure here still leaves the wait
        // interruptible.
        let _ = self.command(cmd, cancel);

        self.wait_event(bit, cancel)
    }

    /// Blocks until the bottom half clears `bit`.
    ///
    /// Fails with [`PipeError::Io`] once the host closed the pipe and with
    /// [`PipeError::Interrupted`] when `cancel` fires.
    pub(crate) fn wait_event(&self, bit: WaitFlags, cancel: &CancelToken) -> Result<()> {
        while self.flags.contains(bit) {
            self.wake
                .wait_until(cancel, || {
                    let flags = self.flags.load();
                    !flags.contains(bit) || flags.contains(WaitFlags::CLOSED_ON_HOST)
                })
                .map_err(|_| PipeError::Interrupted)?;

            if self.flags.contains(WaitFlags::CLOSED_ON_HOST) {
                return Err(PipeError::Io);
            }
        }
        Ok(())
    }

    pub(crate) fn poll(&self, cancel: &CancelToken) -> Result<PollMask> {
        let status = self.command(PipeCommand::Poll, cancel);
        if status < 0 {
            return Err(PipeError::Interrupted);
        }

        let host = HostPollFlags::from_bits_truncate(status as u32);
        let mut mask = PollMask::empty();
        if host.contains(HostPollFlags::IN) {
            mask |= PollMask::IN | PollMask::RDNORM;
        }
        if host.contains(HostPollFlags::OUT) {
            mask |= PollMask::OUT | PollMask::WRNORM;
        }
        if host.contains(HostPollFlags::HUP) {
            mask |= PollMask::HUP;
        }
        if self.flags.contains(WaitFlags::CLOSED_ON_HOST) {
            mask |= PollMask::ERR;
        }
        Ok(mask)
    }

    /// Tears the pipe down: DMA host unmap, CLOSE, unlink, then free.
    ///
    /// The pipe leaves the table and the signal queue before any of its
    /// memory is returned, so the interrupt path can no longer reach it.
    pub(crate) fn release(&self) {
        debug!(pipe = self.id, "releasing pipe");
        self.set_state(PipeState::Closing);

        let dma = self.dma_slot().clone();
        let mut region = dma.as_ref().map(|dma| dma.region());
        if let (Some(dma), Some(region)) = (&dma, &region) {
            self.dma_release_host(dma, region);
        }

        {
            let guard = self.lock.lock();
            let _ = self.command_locked(&guard, PipeCommand::Close);
        }

        {
            let mut state = self.core.lock_state();
            let DeviceState { pipes, signals } = &mut *state;
            signals.remove(pipes, self.id);
            if pipes
                .get(self.id)
                .is_some_and(|registered| std::ptr::eq(&**registered, self))
            {
                pipes.remove(self.id);
            }
        }
        self.set_state(PipeState::Unlinked);

        if let (Some(dma), Some(region)) = (&dma, region.as_mut()) {
            self.dma_release_guest(dma, region);
        }
        drop(region);
        self.dma_slot().take();

        self.core.allocator.free_pages(self.command_paddr, 1);
        debug!(pipe = self.id, "pipe released");
    }
}

/// An open pipe, the equivalent of an open file handle on the pipe device.
///
/// Dropping the handle releases the pipe.
pub struct Pipe {
    shared: Arc<PipeShared>,
    released: bool,
}

impl Pipe {
    pub(crate) fn new(shared: Arc<PipeShared>) -> Self {
        Self {
            shared,
            released: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn state(&self) -> PipeState {
        self.shared.state()
    }

    /// Current wake-wants and host-closed bit.
    pub fn wait_flags(&self) -> WaitFlags {
        self.shared.flags.load()
    }

    pub fn is_closed_by_host(&self) -> bool {
        self.shared.flags.contains(WaitFlags::CLOSED_ON_HOST)
    }

    /// Reads from the host into `[address, address + len)` of `space`.
    ///
    /// Returns the number of bytes moved; `Ok(0)` is end of stream. Once any
    /// bytes moved, later errors are logged and the count is returned.
    pub fn read(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        options: &IoOptions,
    ) -> Result<usize> {
        self.shared
            .transfer(space, address, len, Direction::Read, options)
    }

    /// Writes `[address, address + len)` of `space` to the host.
    pub fn write(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        options: &IoOptions,
    ) -> Result<usize> {
        self.shared
            .transfer(space, address, len, Direction::Write, options)
    }

    /// Keeps writing until all of `len` bytes moved, end of stream, or an
    /// error. Partial progress is reported as success.
    pub fn write_all(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        cancel: &CancelToken,
    ) -> Result<usize> {
        self.transfer_fully(space, address, len, Direction::Write, cancel)
    }

    /// Read counterpart of [`Pipe::write_all`].
    pub fn read_exact(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        cancel: &CancelToken,
    ) -> Result<usize> {
        self.transfer_fully(space, address, len, Direction::Read, cancel)
    }

    fn transfer_fully(
        &self,
        space: &dyn AddressSpace,
        address: u64,
        len: usize,
        direction: Direction,
        cancel: &CancelToken,
    ) -> Result<usize> {
        let options = IoOptions::blocking().with_cancel(cancel.clone());
        let mut done = 0usize;
        while done < len {
            match self.shared.transfer(
                space,
                address + done as u64,
                len - done,
                direction,
                &options,
            ) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(err) if done > 0 => {
                    debug!(pipe = self.id(), %err, done, "stopping after partial transfer");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(done)
    }

    pub fn poll(&self, cancel: &CancelToken) -> Result<PollMask> {
        self.shared.poll(cancel)
    }

    /// Maps the pipe's DMA region into `mapping`, allocating it on first use.
    pub fn mmap(&self, mapping: &mut dyn UserMapping) -> Result<()> {
        self.shared.mmap(mapping)
    }

    /// DMA side-channel control requests.
    pub fn ioctl(&self, request: DmaControl, cancel: &CancelToken) -> Result<DmaControlReply> {
        self.shared.ioctl(request, cancel)
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.shared.release();
        }
    }
}

impl Drop for Pipe {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.shared.id)
            .field("state", &self.shared.state())
            .field("flags", &self.shared.flags.load())
            .finish()
    }
}
