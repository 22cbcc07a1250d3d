//! Optional per-pipe DMA region shared with the host.
//!
//! A pipe may declare one physically contiguous region. It is allocated on the
//! first memory-map request, announced to the host with `DMA_HOST_MAP`, and
//! torn down in two steps when the pipe closes: `DMA_HOST_UNMAP` first, then
//! the guest pages are returned to the allocator after the pipe is unlinked.
//!
//! Ownership of the region's contents is arbitrated by a lock bit. Acquiring
//! it may sleep until the host reports `UNLOCK_DMA`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, error, warn};

use crate::error::{PipeError, Result};
use crate::hal::UserMapping;
use crate::layout::{is_page_multiple, PipeCommand, PAGE_SHIFT, PAGE_SIZE};
use crate::pipe::PipeShared;
use crate::wait::{CancelToken, WaitFlags};

/// Control requests on a pipe's DMA side channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaControl {
    /// Take ownership of the region, sleeping while the host holds it.
    Lock,
    /// Hand the region back and wake anyone waiting for it.
    Unlock,
    /// Physical address of the region, or 0 before it is allocated.
    GetOffset,
    /// Declare a region of `size` bytes; must be a non-zero page multiple.
    CreateRegion { size: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaControlReply {
    Done,
    Offset(u64),
}

#[derive(Debug)]
pub(crate) struct DmaContext {
    size: u64,
    /// Physical base address once allocated.
    region: Mutex<Option<u64>>,
    locked: AtomicBool,
}

impl DmaContext {
    fn new(size: u64) -> Self {
        Self {
            size,
            region: Mutex::new(None),
            locked: AtomicBool::new(false),
        }
    }

    pub(crate) fn size(&self) -> u64 {
        self.size
    }

    fn page_count(&self) -> usize {
        (self.size / PAGE_SIZE) as usize
    }

    pub(crate) fn region(&self) -> MutexGuard<'_, Option<u64>> {
        self.region.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_allocated(&self) -> bool {
        self.region().is_some()
    }
}

impl PipeShared {
    pub(crate) fn dma_context(&self) -> Option<Arc<DmaContext>> {
        self.dma_slot().clone()
    }

    pub(crate) fn create_dma_region(&self, size: u64) -> Result<()> {
        if size == 0 || !is_page_multiple(size) {
            error!(pipe = self.id, size, "DMA region size must be a non-zero page multiple");
            return Err(PipeError::InvalidArgument);
        }

        let mut slot = self.dma_slot();
        if slot.as_ref().is_some_and(|dma| dma.is_allocated()) {
            error!(pipe = self.id, "DMA region already mapped");
            return Err(PipeError::InvalidArgument);
        }
        *slot = Some(Arc::new(DmaContext::new(size)));
        debug!(pipe = self.id, size, "DMA region declared");
        Ok(())
    }

    /// Allocates the region's pages and announces them to the host.
    fn dma_alloc(&self, dma: &DmaContext) -> Result<u64> {
        let paddr = self
            .core
            .allocator
            .alloc_pages(dma.page_count())
            .ok_or_else(|| {
                error!(pipe = self.id, size = dma.size, "could not allocate DMA region");
                PipeError::OutOfMemory
            })?;
        let total = self.core.add_dma_alloc(dma.size);
        debug!(pipe = self.id, paddr, size = dma.size, total, "DMA region allocated");

        let guard = self.lock.lock();
        self.core
            .channel
            .buffer(self.command_paddr)
            .set_dma_params(paddr, dma.size);
        let status = self.command_locked(&guard, PipeCommand::DmaHostMap);
        if status < 0 {
            warn!(pipe = self.id, status, "host rejected DMA map");
        }
        Ok(paddr)
    }

    pub(crate) fn mmap(&self, mapping: &mut dyn UserMapping) -> Result<()> {
        if self.is_closing() {
            return Err(PipeError::InvalidArgument);
        }
        let len = mapping.len();
        if len == 0 || !is_page_multiple(len) {
            error!(pipe = self.id, len, "mapping length must be a page multiple");
            return Err(PipeError::InvalidArgument);
        }
        let dma = self.dma_context().ok_or_else(|| {
            error!(pipe = self.id, "mmap without a DMA region");
            PipeError::InvalidArgument
        })?;
        if len > dma.size() {
            error!(pipe = self.id, len, size = dma.size(), "mapping larger than DMA region");
            return Err(PipeError::InvalidArgument);
        }

        let mut region = dma.region();
        let paddr = match *region {
            Some(paddr) => paddr,
            None => {
                let paddr = self.dma_alloc(&dma)?;
                *region = Some(paddr);
                paddr
            }
        };
        drop(region);

        mapping.remap_pfn_range(paddr >> PAGE_SHIFT, len).map_err(|err| {
            error!(pipe = self.id, %err, "remapping DMA region failed");
            PipeError::WouldBlock
        })
    }

    /// Takes the region lock, waiting for the host's unlock if it is held.
    pub(crate) fn dma_acquire_lock(&self, cancel: &CancelToken) -> Result<()> {
        if self.is_closing() {
            return Ok(());
        }
        let dma = self.dma_context().ok_or_else(|| {
            error!(pipe = self.id, "DMA lock without a DMA region");
            PipeError::InvalidArgument
        })?;

        loop {
            if dma
                .locked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                debug!(pipe = self.id, "DMA region locked");
                return Ok(());
            }

            self.flags.insert(WaitFlags::WAKE_ON_UNLOCK_DMA);
            // The holder may have unlocked before the want-bit was visible.
            if !dma.locked.load(Ordering::Acquire) {
                self.flags.remove(WaitFlags::WAKE_ON_UNLOCK_DMA);
                continue;
            }
            self.wait_event(WaitFlags::WAKE_ON_UNLOCK_DMA, cancel)?;
            if self.is_closing() {
                return Ok(());
            }
        }
    }

    /// Clears the lock bit and the unlock want-bit. Shared by the bottom half
    /// and [`DmaControl::Unlock`]; waking waiters is the caller's job.
    pub(crate) fn dma_clear_lock(&self) {
        if self.is_closing() {
            return;
        }
        match self.dma_context() {
            Some(dma) => {
                if !dma.locked.swap(false, Ordering::AcqRel) {
                    warn!(pipe = self.id, "unlocking a DMA region that is not locked");
                }
            }
            None => warn!(pipe = self.id, "DMA unlock for a pipe without a DMA region"),
        }
        self.flags.remove(WaitFlags::WAKE_ON_UNLOCK_DMA);
    }

    pub(crate) fn dma_release_lock(&self) {
        debug!(pipe = self.id, "DMA region unlocked by caller");
        self.dma_clear_lock();
        self.wake.wake_all();
    }

    pub(crate) fn dma_offset(&self) -> Result<u64> {
        let dma = self.dma_context().ok_or_else(|| {
            error!(pipe = self.id, "DMA offset without a DMA region");
            PipeError::InvalidArgument
        })?;
        let offset = dma.region().unwrap_or(0);
        Ok(offset)
    }

    /// Host half of teardown: tells the host to drop its mapping.
    pub(crate) fn dma_release_host(&self, dma: &DmaContext, region: &Option<u64>) {
        if let Some(paddr) = *region {
            let guard = self.lock.lock();
            self.core
                .channel
                .buffer(self.command_paddr)
                .set_dma_params(paddr, dma.size);
            let status = self.command_locked(&guard, PipeCommand::DmaHostUnmap);
            if status < 0 {
                warn!(pipe = self.id, status, "host rejected DMA unmap");
            }
        }
        dma.locked.store(false, Ordering::Release);
    }

    /// Guest half of teardown: returns the pages once the host forgot them.
    pub(crate) fn dma_release_guest(&self, dma: &DmaContext, region: &mut Option<u64>) {
        if let Some(paddr) = region.take() {
            self.core.allocator.free_pages(paddr, dma.page_count());
            let total = self.core.sub_dma_alloc(dma.size);
            debug!(pipe = self.id, paddr, total, "DMA region freed");
        }
    }

    pub(crate) fn ioctl(
        &self,
        request: DmaControl,
        cancel: &CancelToken,
    ) -> Result<DmaControlReply> {
        if self.is_closing() {
            return Err(PipeError::NotSupported);
        }
        match request {
            DmaControl::Lock => self.dma_acquire_lock(cancel).map(|()| DmaControlReply::Done),
            DmaControl::Unlock => {
                self.dma_release_lock();
                Ok(DmaControlReply::Done)
            }
            DmaControl::GetOffset => self.dma_offset().map(DmaControlReply::Offset),
            DmaControl::CreateRegion { size } => self
                .create_dma_region(size)
                .map(|()| DmaControlReply::Done),
        }
    }
}
