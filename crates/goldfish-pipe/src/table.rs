//! ID-indexed registry of live pipes.
//!
//! The pipe ID is both the host's multiplexing key and the slot index. Each
//! slot also carries the pipe's signal-queue links and pending host flags, so
//! everything the interrupt path touches lives behind the device lock.
//!
//! Growth only happens from [`PipeTable::alloc_id`], which callers reach from
//! `open`, never from interrupt context. Entries are reference-counted
//! handles, so moving them during growth does not invalidate anything held
//! outside the table.

use crate::error::{PipeError, Result};
use crate::layout::HostWakeFlags;

#[derive(Debug)]
pub(crate) struct Slot<T> {
    pub(crate) pipe: T,
    pub(crate) signalled: HostWakeFlags,
    pub(crate) queued: bool,
    pub(crate) prev: Option<u32>,
    pub(crate) next: Option<u32>,
}

impl<T> Slot<T> {
    fn new(pipe: T) -> Self {
        Self {
            pipe,
            signalled: HostWakeFlags::empty(),
            queued: false,
            prev: None,
            next: None,
        }
    }
}

#[derive(Debug)]
pub(crate) struct PipeTable<T> {
    slots: Vec<Option<Slot<T>>>,
}

impl<T> PipeTable<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| PipeError::OutOfMemory)?;
        slots.resize_with(capacity, || None);
        Ok(Self { slots })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Returns the lowest free ID, doubling the table when every slot is
    /// taken.
    pub(crate) fn alloc_id(&mut self) -> Result<u32> {
        if let Some(id) = self.slots.iter().position(Option::is_none) {
            return Ok(id as u32);
        }

        let id = self.slots.len();
        let new_capacity = (id * 2).max(1);
        if new_capacity > u32::MAX as usize {
            return Err(PipeError::OutOfMemory);
        }
        self.slots
            .try_reserve_exact(new_capacity - id)
            .map_err(|_| PipeError::OutOfMemory)?;
        self.slots.resize_with(new_capacity, || None);
        Ok(id as u32)
    }

    pub(crate) fn insert(&mut self, id: u32, pipe: T) {
        let slot = &mut self.slots[id as usize];
        debug_assert!(slot.is_none(), "pipe id {id} already in use");
        *slot = Some(Slot::new(pipe));
    }

    pub(crate) fn remove(&mut self, id: u32) -> Option<T> {
        self.slots
            .get_mut(id as usize)
            .and_then(Option::take)
            .map(|slot| slot.pipe)
    }

    pub(crate) fn get(&self, id: u32) -> Option<&T> {
        self.slot(id).map(|slot| &slot.pipe)
    }

    pub(crate) fn slot(&self, id: u32) -> Option<&Slot<T>> {
        self.slots.get(id as usize).and_then(Option::as_ref)
    }

    pub(crate) fn slot_mut(&mut self, id: u32) -> Option<&mut Slot<T>> {
        self.slots.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// Empties the table, returning every registered pipe.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.slots
            .iter_mut()
            .filter_map(Option::take)
            .map(|slot| slot.pipe)
            .collect()
    }
}
