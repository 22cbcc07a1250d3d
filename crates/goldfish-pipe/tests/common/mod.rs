#![allow(dead_code)]

//! In-process emulation of the goldfish pipe host plus guest memory, used by
//! the integration tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use goldfish_pipe::hal::{AddressSpace, GuestMemory, PageAllocator, RemapError, UserMapping};
use goldfish_pipe::layout::{
    cmd_buf, dev_buf, reg, status, HostPollFlags, HostWakeFlags, PipeCommand, PAGE_SIZE,
};
use goldfish_pipe::{Platform, PipeDevice, PipeDeviceConfig};

pub const MEMORY_PAGES: usize = 4096;
pub const HOST_VERSION: u32 = 2;
const USER_LIMIT: u64 = 1 << 47;
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Flat guest physical memory with a first-fit page allocator.
///
/// Page 0 is never handed out, so a zero physical address always means
/// "unallocated".
pub struct SimMemory {
    bytes: Mutex<Vec<u8>>,
    used: Mutex<Vec<bool>>,
    fail_allocations: AtomicBool,
}

impl SimMemory {
    pub fn new() -> Arc<Self> {
        let mut used = vec![false; MEMORY_PAGES];
        used[0] = true;
        Arc::new(Self {
            bytes: Mutex::new(vec![0; MEMORY_PAGES * PAGE_SIZE as usize]),
            used: Mutex::new(used),
            fail_allocations: AtomicBool::new(false),
        })
    }

    /// Pages currently allocated, excluding the reserved page 0.
    pub fn allocated_pages(&self) -> usize {
        self.used.lock().unwrap().iter().filter(|&&u| u).count() - 1
    }

    pub fn is_allocated(&self, paddr: u64) -> bool {
        self.used.lock().unwrap()[(paddr / PAGE_SIZE) as usize]
    }

    pub fn set_alloc_failure(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::SeqCst);
    }

    pub fn read_vec(&self, paddr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        self.read_physical(paddr, &mut buf);
        buf
    }
}

impl GuestMemory for SimMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        let start = paddr as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
    }

    fn write_physical(&self, paddr: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let start = paddr as usize;
        bytes[start..start + data.len()].copy_from_slice(data);
    }
}

impl PageAllocator for SimMemory {
    fn alloc_pages(&self, count: usize) -> Option<u64> {
        if count == 0 || self.fail_allocations.load(Ordering::SeqCst) {
            return None;
        }
        let mut used = self.used.lock().unwrap();
        let first = (0..=MEMORY_PAGES - count).find(|&p| used[p..p + count].iter().all(|u| !u))?;
        used[first..first + count].iter_mut().for_each(|u| *u = true);
        drop(used);

        let paddr = first as u64 * PAGE_SIZE;
        self.write_physical(paddr, &vec![0; count * PAGE_SIZE as usize]);
        Some(paddr)
    }

    fn free_pages(&self, paddr: u64, count: usize) {
        let mut used = self.used.lock().unwrap();
        let first = (paddr / PAGE_SIZE) as usize;
        for page in &mut used[first..first + count] {
            assert!(*page, "double free of page {paddr:#x}");
            *page = false;
        }
    }
}

#[derive(Debug, Default)]
struct PinState {
    pinned: HashMap<u64, usize>,
    dirty: Vec<u64>,
    pin_calls: usize,
}

/// A user address space whose virtual pages are backed by [`SimMemory`].
pub struct SimAddressSpace {
    memory: Arc<SimMemory>,
    pages: Mutex<BTreeMap<u64, u64>>,
    pins: Mutex<PinState>,
}

impl SimAddressSpace {
    pub fn new(memory: Arc<SimMemory>) -> Self {
        Self {
            memory,
            pages: Mutex::new(BTreeMap::new()),
            pins: Mutex::new(PinState::default()),
        }
    }

    /// Backs `count` pages at `vaddr` with physically contiguous memory.
    pub fn map_contiguous(&self, vaddr: u64, count: usize) {
        let base = self.memory.alloc_pages(count).expect("guest memory exhausted");
        let mut pages = self.pages.lock().unwrap();
        for i in 0..count as u64 {
            pages.insert(vaddr + i * PAGE_SIZE, base + i * PAGE_SIZE);
        }
    }

    /// Backs `count` pages at `vaddr` with physically descending pages, so no
    /// two neighbours can be merged.
    pub fn map_scattered(&self, vaddr: u64, count: usize) {
        let base = self
            .memory
            .alloc_pages(count * 2)
            .expect("guest memory exhausted");
        let mut pages = self.pages.lock().unwrap();
        for i in 0..count as u64 {
            let backing = base + (2 * (count as u64 - 1 - i)) * PAGE_SIZE;
            pages.insert(vaddr + i * PAGE_SIZE, backing);
        }
    }

    fn translate(&self, vaddr: u64) -> u64 {
        let page = vaddr & !(PAGE_SIZE - 1);
        let backing = self.pages.lock().unwrap()[&page];
        backing + (vaddr - page)
    }

    pub fn write_user(&self, vaddr: u64, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            self.memory
                .write_physical(self.translate(vaddr + i as u64), std::slice::from_ref(byte));
        }
    }

    pub fn read_user(&self, vaddr: u64, len: usize) -> Vec<u8> {
        (0..len as u64)
            .map(|i| {
                let mut byte = [0u8];
                self.memory.read_physical(self.translate(vaddr + i), &mut byte);
                byte[0]
            })
            .collect()
    }

    pub fn outstanding_pins(&self) -> usize {
        self.pins.lock().unwrap().pinned.values().sum()
    }

    pub fn dirty_pages(&self) -> Vec<u64> {
        self.pins.lock().unwrap().dirty.clone()
    }

    pub fn pin_calls(&self) -> usize {
        self.pins.lock().unwrap().pin_calls
    }
}

impl AddressSpace for SimAddressSpace {
    fn is_range_accessible(&self, addr: u64, len: usize) -> bool {
        addr.checked_add(len as u64)
            .is_some_and(|end| end <= USER_LIMIT)
    }

    fn pin_pages(&self, first_page: u64, count: usize, _writable: bool) -> Vec<u64> {
        let pages = self.pages.lock().unwrap();
        let pinned: Vec<u64> = (0..count as u64)
            .map_while(|i| pages.get(&(first_page + i * PAGE_SIZE)).copied())
            .collect();
        let mut pins = self.pins.lock().unwrap();
        pins.pin_calls += 1;
        for &page in &pinned {
            *pins.pinned.entry(page).or_default() += 1;
        }
        pinned
    }

    fn unpin_pages(&self, pages: &[u64], dirty: bool) {
        let mut pins = self.pins.lock().unwrap();
        for &page in pages {
            let count = pins.pinned.get_mut(&page).expect("unpin of unpinned page");
            *count -= 1;
            if *count == 0 {
                pins.pinned.remove(&page);
            }
            if dirty {
                pins.dirty.push(page);
            }
        }
    }
}

/// Host view of one pipe.
#[derive(Debug, Default)]
pub struct HostPipe {
    pub command_buffer: u64,
    pub rw_params_max_count: u32,
    /// Bytes the guest wrote.
    pub received: Vec<u8>,
    /// Bytes waiting for the guest to read.
    pub readable: VecDeque<u8>,
    /// Bytes the host accepts before answering "try again"; `None` is unlimited.
    pub write_budget: Option<usize>,
    pub eof: bool,
    pub closed: bool,
    pub wake_on_read: bool,
    pub wake_on_write: bool,
    /// `(n, status)`: the `n`th READ/WRITE (from zero) answers `status`
    /// instead of moving data.
    pub fail_transfer: Option<(usize, i32)>,
    pub poll_override: Option<i32>,
    pub dma: Option<(u64, u64)>,
    /// Descriptor counts of every READ/WRITE, in order.
    pub buffer_counts: Vec<u32>,
}

#[derive(Debug, Default)]
struct HostState {
    driver_version: Option<u32>,
    signal_buffer: u64,
    signal_buffer_count: u32,
    open_buffer: u64,
    pipes: HashMap<u32, HostPipe>,
    closed_pipes: Vec<u32>,
    pending: VecDeque<(u32, HostWakeFlags)>,
    log: Vec<(u32, PipeCommand)>,
    dma_unmaps: Vec<(u32, u64, u64)>,
    refuse_open: Option<i32>,
}

/// Register-level model of the host pipe device.
///
/// Commands execute synchronously inside the write to the execute register.
/// Signals queued with [`EmulatedHost::signal`] are published through the
/// shared page on the next `GET_SIGNALLED` read.
pub struct EmulatedHost {
    memory: Arc<SimMemory>,
    version: u32,
    state: Mutex<HostState>,
    changed: Condvar,
}

impl EmulatedHost {
    pub fn new(memory: Arc<SimMemory>) -> Arc<Self> {
        Self::with_version(memory, HOST_VERSION)
    }

    pub fn with_version(memory: Arc<SimMemory>, version: u32) -> Arc<Self> {
        Arc::new(Self {
            memory,
            version,
            state: Mutex::new(HostState::default()),
            changed: Condvar::new(),
        })
    }

    fn state(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn driver_version(&self) -> Option<u32> {
        self.state().driver_version
    }

    pub fn signal_buffer(&self) -> (u64, u32) {
        let state = self.state();
        (state.signal_buffer, state.signal_buffer_count)
    }

    pub fn open_buffer(&self) -> u64 {
        self.state().open_buffer
    }

    pub fn refuse_open(&self, status: Option<i32>) {
        self.state().refuse_open = status;
    }

    pub fn with_pipe<R>(&self, id: u32, f: impl FnOnce(&mut HostPipe) -> R) -> R {
        let mut state = self.state();
        let pipe = state.pipes.get_mut(&id).expect("no such host pipe");
        f(pipe)
    }

    pub fn is_open(&self, id: u32) -> bool {
        self.state().pipes.contains_key(&id)
    }

    pub fn closed_pipes(&self) -> Vec<u32> {
        self.state().closed_pipes.clone()
    }

    pub fn commands(&self) -> Vec<(u32, PipeCommand)> {
        self.state().log.clone()
    }

    pub fn commands_for(&self, id: u32) -> Vec<PipeCommand> {
        self.state()
            .log
            .iter()
            .filter(|(pipe, _)| *pipe == id)
            .map(|(_, cmd)| *cmd)
            .collect()
    }

    pub fn dma_unmaps(&self) -> Vec<(u32, u64, u64)> {
        self.state().dma_unmaps.clone()
    }

    /// Queues an event for delivery on the next interrupt.
    pub fn signal(&self, id: u32, flags: HostWakeFlags) {
        self.state().pending.push_back((id, flags));
    }

    pub fn pending_signals(&self) -> usize {
        self.state().pending.len()
    }

    /// Makes `data` readable and signals READ if the guest asked for it.
    pub fn push_readable(&self, id: u32, data: &[u8]) {
        let mut state = self.state();
        let pipe = state.pipes.get_mut(&id).expect("no such host pipe");
        pipe.readable.extend(data);
        if std::mem::take(&mut pipe.wake_on_read) {
            state.pending.push_back((id, HostWakeFlags::READ));
        }
    }

    /// Raises the write budget and signals WRITE if the guest asked for it.
    pub fn grant_write(&self, id: u32, bytes: usize) {
        let mut state = self.state();
        let pipe = state.pipes.get_mut(&id).expect("no such host pipe");
        pipe.write_budget = Some(pipe.write_budget.unwrap_or(0) + bytes);
        if std::mem::take(&mut pipe.wake_on_write) {
            state.pending.push_back((id, HostWakeFlags::WRITE));
        }
    }

    pub fn close_from_host(&self, id: u32) {
        let mut state = self.state();
        state.pipes.get_mut(&id).expect("no such host pipe").closed = true;
        state.pending.push_back((id, HostWakeFlags::CLOSED));
    }

    /// Blocks until `pred` holds for the host state of pipe `id`.
    pub fn wait_for_pipe(&self, id: u32, mut pred: impl FnMut(&HostPipe) -> bool) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut state = self.state();
        loop {
            if state.pipes.get(&id).is_some_and(&mut pred) {
                return;
            }
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting on host pipe {id}");
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Blocks until the guest logged `count` commands of kind `cmd` for `id`.
    pub fn wait_for_command(&self, id: u32, cmd: PipeCommand, count: usize) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        let mut state = self.state();
        loop {
            let seen = state.log.iter().filter(|&&entry| entry == (id, cmd)).count();
            if seen >= count {
                return;
            }
            let now = Instant::now();
            assert!(now < deadline, "timed out waiting for {cmd:?} on pipe {id}");
            state = self.changed.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    fn publish_signals(&self, state: &mut HostState) -> u32 {
        let mut count = 0u32;
        while count < state.signal_buffer_count {
            let Some((id, flags)) = state.pending.pop_front() else {
                break;
            };
            let entry = state.signal_buffer + u64::from(count) * dev_buf::SIGNALLED_ENTRY_BYTES;
            self.memory.write_u32(entry, id);
            self.memory.write_u32(entry + 4, flags.bits());
            count += 1;
        }
        count
    }

    fn execute(&self, state: &mut HostState, id: u32) {
        let buffer = match state.pipes.get(&id) {
            Some(pipe) => pipe.command_buffer,
            None => self
                .memory
                .read_u64(state.open_buffer + dev_buf::OPEN_COMMAND_BUFFER_PTR),
        };
        let raw = self.memory.read_i32(buffer + cmd_buf::CMD);
        let Some(cmd) = PipeCommand::from_raw(raw) else {
            self.memory
                .write_i32(buffer + cmd_buf::STATUS, status::ERROR_INVAL);
            return;
        };
        assert_eq!(self.memory.read_u32(buffer + cmd_buf::ID), id, "id mismatch");
        state.log.push((id, cmd));

        let result = match cmd {
            PipeCommand::Open => self.open(state, id, buffer),
            PipeCommand::Close => {
                state.pipes.remove(&id);
                state.closed_pipes.push(id);
                0
            }
            PipeCommand::DmaHostUnmap => {
                let paddr = self.memory.read_u64(buffer + cmd_buf::DMA_PADDR);
                let size = self.memory.read_u64(buffer + cmd_buf::DMA_SIZE);
                state.dma_unmaps.push((id, paddr, size));
                if let Some(pipe) = state.pipes.get_mut(&id) {
                    pipe.dma = None;
                }
                0
            }
            _ => match state.pipes.get_mut(&id) {
                Some(pipe) => self.pipe_command(pipe, cmd, buffer),
                None => status::ERROR_IO,
            },
        };
        self.memory.write_i32(buffer + cmd_buf::STATUS, result);
    }

    fn open(&self, state: &mut HostState, id: u32, buffer: u64) -> i32 {
        if let Some(refusal) = state.refuse_open {
            return refusal;
        }
        assert!(!state.pipes.contains_key(&id), "pipe {id} opened twice");
        let rw_params_max_count = self
            .memory
            .read_u32(state.open_buffer + dev_buf::OPEN_RW_PARAMS_MAX_COUNT);
        state.pipes.insert(
            id,
            HostPipe {
                command_buffer: buffer,
                rw_params_max_count,
                ..HostPipe::default()
            },
        );
        0
    }

    fn pipe_command(&self, pipe: &mut HostPipe, cmd: PipeCommand, buffer: u64) -> i32 {
        match cmd {
            PipeCommand::Write | PipeCommand::Read => {
                let count = self.memory.read_u32(buffer + cmd_buf::RW_BUFFERS_COUNT);
                assert!(count <= pipe.rw_params_max_count, "too many buffers");
                pipe.buffer_counts.push(count);
                if let Some((index, forced)) = pipe.fail_transfer {
                    if pipe.buffer_counts.len() - 1 == index {
                        pipe.fail_transfer = None;
                        return forced;
                    }
                }
                if pipe.closed {
                    return status::ERROR_IO;
                }
                let descriptors: Vec<(u64, usize)> = (0..count as usize)
                    .map(|i| {
                        (
                            self.memory.read_u64(buffer + cmd_buf::rw_ptr(i)),
                            self.memory.read_u32(buffer + cmd_buf::rw_size(i)) as usize,
                        )
                    })
                    .collect();
                let moved = if cmd == PipeCommand::Write {
                    self.host_write(pipe, &descriptors)
                } else {
                    self.host_read(pipe, &descriptors)
                };
                match moved {
                    Ok(n) => {
                        self.memory
                            .write_i32(buffer + cmd_buf::RW_CONSUMED_SIZE, n as i32);
                        n as i32
                    }
                    Err(status) => status,
                }
            }
            PipeCommand::WakeOnRead => {
                pipe.wake_on_read = true;
                0
            }
            PipeCommand::WakeOnWrite => {
                pipe.wake_on_write = true;
                0
            }
            PipeCommand::Poll => {
                if let Some(forced) = pipe.poll_override {
                    return forced;
                }
                let mut mask = HostPollFlags::empty();
                if !pipe.readable.is_empty() {
                    mask |= HostPollFlags::IN;
                }
                if pipe.write_budget.map_or(true, |budget| budget > 0) {
                    mask |= HostPollFlags::OUT;
                }
                if pipe.closed || pipe.eof {
                    mask |= HostPollFlags::HUP;
                }
                mask.bits() as i32
            }
            PipeCommand::DmaHostMap => {
                let paddr = self.memory.read_u64(buffer + cmd_buf::DMA_PADDR);
                let size = self.memory.read_u64(buffer + cmd_buf::DMA_SIZE);
                pipe.dma = Some((paddr, size));
                0
            }
            _ => status::ERROR_INVAL,
        }
    }

    fn host_write(&self, pipe: &mut HostPipe, descriptors: &[(u64, usize)]) -> Result<usize, i32> {
        let total: usize = descriptors.iter().map(|&(_, len)| len).sum();
        let allowed = pipe.write_budget.map_or(total, |budget| budget.min(total));
        if allowed == 0 {
            return Err(status::ERROR_AGAIN);
        }
        let mut left = allowed;
        for &(paddr, len) in descriptors {
            let take = len.min(left);
            pipe.received.extend(self.memory.read_vec(paddr, take));
            left -= take;
            if left == 0 {
                break;
            }
        }
        if let Some(budget) = pipe.write_budget.as_mut() {
            *budget -= allowed;
        }
        Ok(allowed)
    }

    fn host_read(&self, pipe: &mut HostPipe, descriptors: &[(u64, usize)]) -> Result<usize, i32> {
        if pipe.readable.is_empty() {
            return if pipe.eof { Ok(0) } else { Err(status::ERROR_AGAIN) };
        }
        let mut moved = 0;
        for &(paddr, len) in descriptors {
            let take = len.min(pipe.readable.len());
            let chunk: Vec<u8> = pipe.readable.drain(..take).collect();
            self.memory.write_physical(paddr, &chunk);
            moved += take;
            if pipe.readable.is_empty() {
                break;
            }
        }
        Ok(moved)
    }
}

impl goldfish_pipe::RegisterWindow for EmulatedHost {
    fn read_u32(&self, offset: u64) -> u32 {
        let mut state = self.state();
        match offset {
            reg::VERSION => self.version,
            reg::GET_SIGNALLED => self.publish_signals(&mut state),
            _ => 0,
        }
    }

    fn write_u32(&self, offset: u64, value: u32) {
        let mut state = self.state();
        let value = u64::from(value);
        match offset {
            reg::VERSION => state.driver_version = Some(value as u32),
            reg::SIGNAL_BUFFER_HIGH => {
                state.signal_buffer = (state.signal_buffer & 0xffff_ffff) | (value << 32)
            }
            reg::SIGNAL_BUFFER => {
                state.signal_buffer = (state.signal_buffer & !0xffff_ffff) | value
            }
            reg::SIGNAL_BUFFER_COUNT => state.signal_buffer_count = value as u32,
            reg::OPEN_BUFFER_HIGH => {
                state.open_buffer = (state.open_buffer & 0xffff_ffff) | (value << 32)
            }
            reg::OPEN_BUFFER => state.open_buffer = (state.open_buffer & !0xffff_ffff) | value,
            reg::CMD => self.execute(&mut state, value as u32),
            _ => {}
        }
        drop(state);
        self.changed.notify_all();
    }
}

/// A user mapping that records what the driver remapped into it.
#[derive(Debug, Default)]
pub struct SimMapping {
    pub len: u64,
    pub mapped: Option<(u64, u64)>,
    pub fail: bool,
}

impl SimMapping {
    pub fn new(len: u64) -> Self {
        Self {
            len,
            ..Self::default()
        }
    }
}

impl UserMapping for SimMapping {
    fn len(&self) -> u64 {
        self.len
    }

    fn remap_pfn_range(&mut self, pfn: u64, len: u64) -> Result<(), RemapError> {
        if self.fail {
            return Err(RemapError);
        }
        self.mapped = Some((pfn, len));
        Ok(())
    }
}

pub struct Harness {
    pub memory: Arc<SimMemory>,
    pub host: Arc<EmulatedHost>,
    pub device: Arc<PipeDevice>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(PipeDeviceConfig::default())
    }

    pub fn with_config(config: PipeDeviceConfig) -> Self {
        init_tracing();
        let memory = SimMemory::new();
        let host = EmulatedHost::new(memory.clone());
        let device = PipeDevice::init(platform(&memory, &host), config).expect("attach");
        Self {
            memory,
            host,
            device: Arc::new(device),
        }
    }

    pub fn address_space(&self) -> SimAddressSpace {
        SimAddressSpace::new(self.memory.clone())
    }

    /// Raises the device interrupt, as the host would after queueing signals.
    pub fn interrupt(&self) {
        self.device.interrupt();
    }
}

pub fn platform(memory: &Arc<SimMemory>, host: &Arc<EmulatedHost>) -> Platform {
    Platform {
        registers: host.clone(),
        memory: memory.clone(),
        allocator: memory.clone(),
    }
}

/// Polls `pred` until it holds or the test times out.
pub fn eventually(what: &str, mut pred: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !pred() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
