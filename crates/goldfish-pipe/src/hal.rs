//! Platform collaborators the driver core is handed at attach time.
//!
//! Bus probing, interrupt routing and page allocation live outside this crate.
//! The core only needs a mapped register window, access to guest physical
//! memory (command buffers, the shared device page, DMA regions), a
//! page-granular allocator and, per caller, a way to pin user pages.

use std::fmt;
use std::sync::Arc;

/// The device's mapped one-page register window.
///
/// A write to [`crate::layout::reg::CMD`] is synchronous: the host has fully
/// processed the command, including its status write-back, by the time
/// `write_u32` returns.
pub trait RegisterWindow: Send + Sync {
    fn read_u32(&self, offset: u64) -> u32;
    fn write_u32(&self, offset: u64, value: u32);
}

/// Guest physical memory shared with the host.
pub trait GuestMemory: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);
    fn write_physical(&self, paddr: u64, data: &[u8]);

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_i32(&self, paddr: u64) -> i32 {
        self.read_u32(paddr) as i32
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&self, paddr: u64, val: u32) {
        self.write_physical(paddr, &val.to_le_bytes());
    }

    fn write_i32(&self, paddr: u64, val: i32) {
        self.write_u32(paddr, val as u32);
    }

    fn write_u64(&self, paddr: u64, val: u64) {
        self.write_physical(paddr, &val.to_le_bytes());
    }
}

/// Page-granular allocator for host-visible memory.
pub trait PageAllocator: Send + Sync {
    /// Allocates `count` physically contiguous, zeroed pages and returns the
    /// physical address of the first one.
    fn alloc_pages(&self, count: usize) -> Option<u64>;

    fn free_pages(&self, paddr: u64, count: usize);
}

/// A caller's address space, used to pin the pages backing a user buffer.
pub trait AddressSpace {
    /// Returns whether `[addr, addr + len)` is a valid user range at all.
    fn is_range_accessible(&self, _addr: u64, _len: usize) -> bool {
        true
    }

    /// Pins up to `count` pages starting at the page-aligned `first_page`.
    ///
    /// Returns the physical addresses of the pinned prefix, which may be
    /// shorter than requested (or empty if the first page is not mapped).
    /// `writable` is set when the driver will store into the pages (a pipe
    /// read).
    fn pin_pages(&self, first_page: u64, count: usize, writable: bool) -> Vec<u64>;

    /// Releases pages returned by [`AddressSpace::pin_pages`], marking them
    /// dirty first when `dirty` is set.
    fn unpin_pages(&self, pages: &[u64], dirty: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapError;

impl fmt::Display for RemapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to remap physical range")
    }
}

impl std::error::Error for RemapError {}

/// A user virtual mapping being set up by a memory-map request.
///
/// The mapping's own open/close events carry no meaning for the driver: the
/// mapped DMA region lives exactly as long as its pipe.
pub trait UserMapping {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backs the whole mapping with `len` bytes starting at page frame `pfn`.
    fn remap_pfn_range(&mut self, pfn: u64, len: u64) -> Result<(), RemapError>;
}

/// Everything the core receives from bus/probe glue.
#[derive(Clone)]
pub struct Platform {
    pub registers: Arc<dyn RegisterWindow>,
    pub memory: Arc<dyn GuestMemory>,
    pub allocator: Arc<dyn PageAllocator>,
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}
