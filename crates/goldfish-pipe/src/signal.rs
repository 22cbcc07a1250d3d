//! Device-wide list of pipes with undelivered host events.
//!
//! The list is intrusive in the [`PipeTable`]: each slot stores its `prev` /
//! `next` neighbour IDs, and the queue only remembers the head. All
//! operations run under the device lock.
//!
//! Signalled pipes are pushed at the front, so draining is most-recent-first.
//! The bottom half always drains the whole list, so order carries no meaning.

use std::mem;

use crate::layout::HostWakeFlags;
use crate::table::PipeTable;

#[derive(Debug, Default)]
pub(crate) struct SignalQueue {
    head: Option<u32>,
}

impl SignalQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Records `flags` for pipe `id`, linking it at the front if it is not
    /// queued yet. Events for IDs with no live pipe are dropped.
    pub(crate) fn add<T>(
        &mut self,
        table: &mut PipeTable<T>,
        id: u32,
        flags: HostWakeFlags,
    ) -> bool {
        let head = self.head;
        let Some(slot) = table.slot_mut(id) else {
            return false;
        };
        slot.signalled |= flags;
        if slot.queued {
            return true;
        }
        slot.queued = true;
        slot.prev = None;
        slot.next = head;

        if let Some(old_head) = head.and_then(|h| table.slot_mut(h)) {
            old_head.prev = Some(id);
        }
        self.head = Some(id);
        true
    }

    /// Detaches the head pipe and hands back its accumulated flags.
    pub(crate) fn pop_front<T: Clone>(
        &mut self,
        table: &mut PipeTable<T>,
    ) -> Option<(u32, T, HostWakeFlags)> {
        let id = self.head?;
        let Some(slot) = table.slot_mut(id) else {
            // Unreachable while close unlinks before removing the slot.
            self.head = None;
            return None;
        };

        let flags = mem::take(&mut slot.signalled);
        let next = slot.next.take();
        slot.prev = None;
        slot.queued = false;
        let pipe = slot.pipe.clone();

        self.head = next;
        if let Some(new_head) = next.and_then(|n| table.slot_mut(n)) {
            new_head.prev = None;
        }
        Some((id, pipe, flags))
    }

    /// Unlinks pipe `id` from anywhere in the list.
    pub(crate) fn remove<T>(&mut self, table: &mut PipeTable<T>, id: u32) {
        let Some(slot) = table.slot_mut(id) else {
            return;
        };
        if !slot.queued {
            return;
        }
        let prev = slot.prev.take();
        let next = slot.next.take();
        slot.queued = false;
        slot.signalled = HostWakeFlags::empty();

        match prev {
            Some(p) => {
                if let Some(prev_slot) = table.slot_mut(p) {
                    prev_slot.next = next;
                }
            }
            None => {
                if self.head == Some(id) {
                    self.head = next;
                }
            }
        }
        if let Some(next_slot) = next.and_then(|n| table.slot_mut(n)) {
            next_slot.prev = prev;
        }
    }
}
