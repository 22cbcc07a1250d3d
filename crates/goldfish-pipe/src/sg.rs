//! Scatter-gather mapping of user buffers into READ/WRITE descriptors.
//!
//! A transfer pins the pages behind a user range, then hands the host a list
//! of `(physical address, length)` pairs. Runs of physically contiguous pages
//! collapse into one descriptor, which for the usual contiguous allocation
//! means very few descriptors per command.

use crate::error::{PipeError, Result};
use crate::hal::AddressSpace;
use crate::layout::{page_align_down, page_offset, PAGE_SIZE};

/// Which way bytes move, from the caller's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Host to guest: pinned pages are stored into.
    Read,
    /// Guest to host.
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub paddr: u64,
    pub len: u32,
}

/// Builds descriptors for pinned `pages` covering the start of
/// `[address, address_end)`.
///
/// The first page starts at the in-page offset of `address`. The last pinned
/// page contributes `last_chunk_page_size` bytes; every interior page a full
/// page.
pub fn merge_pages(
    pages: &[u64],
    address: u64,
    address_end: u64,
    last_chunk_page_size: u64,
) -> Vec<BufferDescriptor> {
    let Some((&first, rest)) = pages.split_first() else {
        return Vec::new();
    };

    let first_page = page_align_down(address);
    let last_page = page_align_down(address_end - 1);
    let first_size = if first_page == last_page {
        address_end - address
    } else {
        PAGE_SIZE - page_offset(address)
    };

    let mut descriptors = Vec::with_capacity(pages.len());
    descriptors.push(BufferDescriptor {
        paddr: first | page_offset(address),
        len: first_size as u32,
    });

    let mut prev = first;
    for (i, &paddr) in rest.iter().enumerate() {
        let size = if i + 1 == rest.len() {
            last_chunk_page_size
        } else {
            PAGE_SIZE
        };
        match descriptors.last_mut() {
            Some(current) if paddr == prev + PAGE_SIZE => current.len += size as u32,
            _ => descriptors.push(BufferDescriptor {
                paddr,
                len: size as u32,
            }),
        }
        prev = paddr;
    }
    descriptors
}

/// Pins user pages and turns them into merged descriptors, at most
/// `max_pages` pages per call.
#[derive(Debug, Clone, Copy)]
pub struct ScatterGatherMapper {
    max_pages: usize,
}

impl ScatterGatherMapper {
    pub fn new(max_pages: usize) -> Self {
        Self { max_pages }
    }

    /// Pins the next chunk of `[address, address_end)`.
    ///
    /// Only a prefix is pinned when the range spans more than `max_pages`
    /// pages or the address space pins fewer pages than requested; the caller
    /// loops on what the host consumed.
    pub fn map_and_merge<'a>(
        &self,
        space: &'a dyn AddressSpace,
        address: u64,
        address_end: u64,
        direction: Direction,
    ) -> Result<MappedChunk<'a>> {
        debug_assert!(address < address_end);

        let first_page = page_align_down(address);
        let last_page = page_align_down(address_end - 1);
        let last_page_size = page_offset(address_end - 1) + 1;

        let mut requested = ((last_page - first_page) / PAGE_SIZE) as usize + 1;
        let mut chunk_last_page_size = last_page_size;
        if requested > self.max_pages {
            requested = self.max_pages;
            chunk_last_page_size = PAGE_SIZE;
        }

        let writable = direction == Direction::Read;
        let pages = space.pin_pages(first_page, requested, writable);
        if pages.is_empty() {
            return Err(PipeError::Fault);
        }
        let pinned = PinnedPages {
            space,
            pages,
            direction,
        };
        if pinned.pages.len() > requested {
            return Err(PipeError::Fault);
        }
        if pinned.pages.len() < requested {
            chunk_last_page_size = PAGE_SIZE;
        }

        let descriptors = merge_pages(&pinned.pages, address, address_end, chunk_last_page_size);
        Ok(MappedChunk {
            descriptors,
            pinned,
        })
    }
}

/// Pages pinned for one command. Unpinned on drop if not released first.
struct PinnedPages<'a> {
    space: &'a dyn AddressSpace,
    pages: Vec<u64>,
    direction: Direction,
}

impl Drop for PinnedPages<'_> {
    fn drop(&mut self) {
        if !self.pages.is_empty() {
            self.space.unpin_pages(&self.pages, false);
        }
    }
}

/// Descriptors for one READ/WRITE command plus the pins backing them.
pub struct MappedChunk<'a> {
    descriptors: Vec<BufferDescriptor>,
    pinned: PinnedPages<'a>,
}

impl MappedChunk<'_> {
    pub fn descriptors(&self) -> &[BufferDescriptor] {
        &self.descriptors
    }

    pub fn page_count(&self) -> usize {
        self.pinned.pages.len()
    }

    /// Unpins after the command ran. Pages of a read that moved any bytes are
    /// marked dirty.
    pub fn release(mut self, consumed_size: i32) {
        let dirty = self.pinned.direction == Direction::Read && consumed_size > 0;
        let pages = std::mem::take(&mut self.pinned.pages);
        self.pinned.space.unpin_pages(&pages, dirty);
    }
}
