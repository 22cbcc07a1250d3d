//! Register and shared-memory layout contract with the host pipe device.
//!
//! The guest and the emulator exchange three kinds of state:
//!
//! - a one-page register window (see [`reg`]),
//! - one command buffer page per open pipe (see [`cmd_buf`]),
//! - one device-wide shared page holding the open-command parameters and the
//!   signalled-pipe array (see [`dev_buf`]).
//!
//! All multi-byte fields are little-endian. These constants must match the
//! host's pipe device implementation bit for bit.

use bitflags::bitflags;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const PAGE_MASK: u64 = !(PAGE_SIZE - 1);

/// Protocol version reported by this driver through [`reg::VERSION`].
///
/// Version 2 was an intermediate release and is not supported anymore.
pub const PIPE_DRIVER_VERSION: u32 = 4;

/// Lowest host device version that speaks the command-buffer protocol.
///
/// Hosts reporting anything older only implement the legacy register-based
/// protocol.
pub const PIPE_CURRENT_DEVICE_VERSION: u32 = 2;

/// Capacity of the buffer descriptor arrays in a command buffer.
pub const MAX_BUFFERS_PER_COMMAND: usize = 336;

/// Maximum number of `(id, flags)` pairs drained per interrupt.
pub const MAX_SIGNALLED_PIPES: usize = 64;

pub const INITIAL_PIPES_CAPACITY: usize = 64;

/// Byte offsets into the register window.
pub mod reg {
    /// Write a pipe ID to execute the command in that pipe's command buffer.
    pub const CMD: u64 = 0;

    pub const SIGNAL_BUFFER_HIGH: u64 = 4;
    pub const SIGNAL_BUFFER: u64 = 8;
    pub const SIGNAL_BUFFER_COUNT: u64 = 12;

    pub const OPEN_BUFFER_HIGH: u64 = 20;
    pub const OPEN_BUFFER: u64 = 24;

    /// Write the driver version, then read the device version back.
    pub const VERSION: u64 = 36;

    /// Reading fills the signal buffer and returns the number of entries
    /// written. The interrupt stays asserted while more entries remain.
    pub const GET_SIGNALLED: u64 = 48;

    pub const WINDOW_BYTES: u64 = super::PAGE_SIZE;
}

/// Command codes written to [`cmd_buf::CMD`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum PipeCommand {
    Open = 1,
    Close = 2,
    Poll = 3,
    Write = 4,
    WakeOnWrite = 5,
    Read = 6,
    WakeOnRead = 7,
    /// Reserved for deferred host-side I/O; never issued by this driver.
    WakeOnDoneIo = 8,
    DmaHostMap = 9,
    DmaHostUnmap = 10,
}

impl PipeCommand {
    pub fn from_raw(raw: i32) -> Option<Self> {
        Some(match raw {
            1 => PipeCommand::Open,
            2 => PipeCommand::Close,
            3 => PipeCommand::Poll,
            4 => PipeCommand::Write,
            5 => PipeCommand::WakeOnWrite,
            6 => PipeCommand::Read,
            7 => PipeCommand::WakeOnRead,
            8 => PipeCommand::WakeOnDoneIo,
            9 => PipeCommand::DmaHostMap,
            10 => PipeCommand::DmaHostUnmap,
            _ => return None,
        })
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Negative values the host stores into [`cmd_buf::STATUS`].
pub mod status {
    pub const ERROR_INVAL: i32 = -1;
    pub const ERROR_AGAIN: i32 = -2;
    pub const ERROR_NOMEM: i32 = -3;
    pub const ERROR_IO: i32 = -4;
}

/// Per-pipe command buffer (one page).
///
/// Layout:
/// - `cmd: i32`, `id: i32`, `status: i32`, `reserved: i32`
/// - parameters union:
///   - read/write: `buffers_count: u32`, `consumed_size: i32`,
///     `ptrs: [u64; MAX_BUFFERS_PER_COMMAND]`, `sizes: [u32; MAX_BUFFERS_PER_COMMAND]`
///   - DMA map/unmap: `dma_paddr: u64`, `sz: u64`
pub mod cmd_buf {
    use super::MAX_BUFFERS_PER_COMMAND;

    pub const CMD: u64 = 0;
    pub const ID: u64 = 4;
    pub const STATUS: u64 = 8;
    pub const RESERVED: u64 = 12;
    pub const PARAMS: u64 = 16;

    pub const RW_BUFFERS_COUNT: u64 = PARAMS;
    pub const RW_CONSUMED_SIZE: u64 = PARAMS + 4;
    pub const RW_PTRS: u64 = PARAMS + 8;
    pub const RW_SIZES: u64 = RW_PTRS + 8 * MAX_BUFFERS_PER_COMMAND as u64;

    pub const DMA_PADDR: u64 = PARAMS;
    pub const DMA_SIZE: u64 = PARAMS + 8;

    pub const BYTES: u64 = RW_SIZES + 4 * MAX_BUFFERS_PER_COMMAND as u64;

    pub const fn rw_ptr(index: usize) -> u64 {
        RW_PTRS + 8 * index as u64
    }

    pub const fn rw_size(index: usize) -> u64 {
        RW_SIZES + 4 * index as u64
    }
}

/// Device-wide page shared with the host.
///
/// Layout:
/// - open parameters: `command_buffer_ptr: u64`, `rw_params_max_count: u32`, 4 bytes padding
/// - `[ { id: u32, flags: u32 }; MAX_SIGNALLED_PIPES ]`
pub mod dev_buf {
    pub const OPEN_COMMAND_BUFFER_PTR: u64 = 0;
    pub const OPEN_RW_PARAMS_MAX_COUNT: u64 = 8;
    pub const OPEN_PARAMS_BYTES: u64 = 16;

    pub const SIGNALLED: u64 = OPEN_PARAMS_BYTES;
    pub const SIGNALLED_ENTRY_BYTES: u64 = 8;

    pub const fn signalled_id(index: usize) -> u64 {
        SIGNALLED + SIGNALLED_ENTRY_BYTES * index as u64
    }

    pub const fn signalled_flags(index: usize) -> u64 {
        signalled_id(index) + 4
    }
}

bitflags! {
    /// Readiness bits returned as the status of a POLL command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HostPollFlags: u32 {
        const IN = 1 << 0;
        const OUT = 1 << 1;
        const HUP = 1 << 2;
    }
}

bitflags! {
    /// Event bits the host reports for a signalled pipe.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HostWakeFlags: u32 {
        /// The host closed the pipe.
        const CLOSED = 1 << 0;
        /// The pipe can be read from again.
        const READ = 1 << 1;
        /// The pipe can be written to again.
        const WRITE = 1 << 2;
        /// The pipe's DMA region can be written to again.
        const UNLOCK_DMA = 1 << 3;
    }
}

pub const fn is_page_multiple(size: u64) -> bool {
    size & (PAGE_SIZE - 1) == 0
}

pub const fn page_align_down(addr: u64) -> u64 {
    addr & PAGE_MASK
}

pub const fn page_offset(addr: u64) -> u64 {
    addr & !PAGE_MASK
}

const _: () = assert!(cmd_buf::BYTES <= PAGE_SIZE);
const _: () = assert!(
    dev_buf::SIGNALLED + dev_buf::SIGNALLED_ENTRY_BYTES * MAX_SIGNALLED_PIPES as u64 <= PAGE_SIZE
);
