//! Directory evict buffer.
//!
//! When a bounded directory victimises an entry that still has sharers, the entry moves
//! here until every sharer has been back-invalidated. The buffer provides:
//! 1. **Admission:** Reservations so a request that may victimise an entry is guaranteed
//!    a slot for it.
//! 2. **Invalidate Tracking:** Per-entry sent/outstanding counts and a buffer-wide count
//!    of entries with invalidations in flight.
//! 3. **Idle Work:** FIFO retrieval of the oldest entry still needing invalidation.
//!
//! An unbounded variant (no capacity) always has space and ignores reservations.

use std::collections::VecDeque;

use crate::common::PhysAddr;
use crate::state::SharerSet;

/// An evicted directory entry awaiting back-invalidation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEbEntry {
    /// Block address.
    pub addr: PhysAddr,
    /// Sharers that must still be invalidated.
    pub state: SharerSet,
    invalidates_sent: usize,
    /// Cache-EB reservations parked on this entry.
    pub cache_eb_reserved: usize,
}

impl DirEbEntry {
    /// True until the first back-invalidation round has been issued.
    #[inline]
    pub const fn invalidates_required(&self) -> bool {
        self.invalidates_sent == 0
    }

    /// Invalidations issued and not yet acknowledged.
    #[inline]
    pub const fn invalidates_pending(&self) -> usize {
        self.invalidates_sent
    }
}

/// FIFO of evicted directory entries.
#[derive(Debug)]
pub struct DirEvictBuffer {
    entries: VecDeque<DirEbEntry>,
    capacity: Option<usize>,
    reserved: usize,
    pending_invalidates: usize,
}

impl DirEvictBuffer {
    /// Creates a bounded buffer with `size` slots.
    pub fn bounded(size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(size),
            capacity: Some(size),
            reserved: 0,
            pending_invalidates: 0,
        }
    }

    /// Creates a buffer that never runs out of space.
    pub fn unbounded() -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: None,
            reserved: 0,
            pending_invalidates: 0,
        }
    }

    /// Drops every buffered entry and its in-flight invalidate count. Reservations held
    /// by admitted processes survive.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending_invalidates = 0;
    }

    /// True if used plus reserved slots reach the size.
    pub fn is_full(&self) -> bool {
        self.capacity
            .is_some_and(|size| self.entries.len() + self.reserved >= size)
    }

    /// True if a slot is free now or will be freed by in-flight invalidations.
    pub fn free_slots_pending(&self) -> bool {
        match self.capacity {
            None => true,
            Some(size) => self.pending_invalidates > 0 || self.entries.len() + self.reserved < size,
        }
    }

    /// True if `n` more reservations fit.
    pub fn has_space(&self, n: usize) -> bool {
        self.capacity
            .is_none_or(|size| self.entries.len() + self.reserved + n <= size)
    }

    /// True if an insert would fit regardless of reservations.
    pub fn has_free_slot(&self) -> bool {
        self.capacity.is_none_or(|size| self.entries.len() < size)
    }

    /// Claims `n` slots.
    ///
    /// # Panics
    ///
    /// Panics on over-reservation of a bounded buffer.
    pub fn reserve(&mut self, n: usize) {
        if let Some(size) = self.capacity {
            assert!(
                self.entries.len() + self.reserved + n <= size,
                "dir EB over-reserved: {} used + {} reserved + {n} > {size}",
                self.entries.len(),
                self.reserved
            );
            self.reserved += n;
        }
    }

    /// Releases `n` reserved slots.
    pub fn unreserve(&mut self, n: usize) {
        if self.capacity.is_some() {
            assert!(
                self.reserved >= n,
                "dir EB released {n} slots with only {} reserved",
                self.reserved
            );
            self.reserved -= n;
        }
    }

    /// Appends an evicted entry.
    ///
    /// # Panics
    ///
    /// Panics if the address is already buffered or the buffer has no free slot.
    pub fn insert(&mut self, addr: PhysAddr, state: SharerSet) {
        assert!(
            self.find(addr).is_none(),
            "dir EB already holds an entry for {addr}"
        );
        assert!(self.has_free_slot(), "dir EB overflow inserting {addr}");
        self.entries.push_back(DirEbEntry {
            addr,
            state,
            invalidates_sent: 0,
            cache_eb_reserved: 0,
        });
    }

    /// Removes the entry for `addr`.
    ///
    /// # Panics
    ///
    /// Panics if there is no entry, or if the entry still has sharers that were never
    /// sent an invalidation.
    pub fn remove(&mut self, addr: PhysAddr) -> DirEbEntry {
        let Some(pos) = self.entries.iter().position(|e| e.addr == addr) else {
            panic!("removing dir EB entry {addr} that does not exist");
        };
        let entry = &self.entries[pos];
        assert!(
            !(entry.invalidates_required() && !entry.state.no_sharers()),
            "dir EB entry {addr} removed before sharers {} were invalidated",
            entry.state
        );
        if entry.invalidates_pending() > 0 {
            self.pending_invalidates -= 1;
        }
        match self.entries.remove(pos) {
            Some(e) => e,
            None => unreachable!("position {pos} was just found"),
        }
    }

    /// Removes an entry that is being moved back into the directory.
    ///
    /// Unlike [`DirEvictBuffer::remove`], the sharers travel with the entry, so an entry
    /// that was never invalidated may leave.
    pub fn reclaim(&mut self, addr: PhysAddr) -> DirEbEntry {
        let Some(pos) = self.entries.iter().position(|e| e.addr == addr) else {
            panic!("reclaiming dir EB entry {addr} that does not exist");
        };
        assert!(
            self.entries[pos].invalidates_pending() == 0,
            "reclaiming dir EB entry {addr} with invalidations in flight"
        );
        match self.entries.remove(pos) {
            Some(e) => e,
            None => unreachable!("position {pos} was just found"),
        }
    }

    /// Entry for `addr`.
    pub fn find(&self, addr: PhysAddr) -> Option<&DirEbEntry> {
        self.entries.iter().find(|e| e.addr == addr)
    }

    /// Mutable entry for `addr`.
    pub fn find_mut(&mut self, addr: PhysAddr) -> Option<&mut DirEbEntry> {
        self.entries.iter_mut().find(|e| e.addr == addr)
    }

    /// Records that `count` back-invalidations were sent for `addr`.
    pub fn set_invalidates_pending(&mut self, addr: PhysAddr, count: usize) {
        let Some(entry) = self.find_mut(addr) else {
            panic!("setting invalidates on missing dir EB entry {addr}");
        };
        assert!(count > 0, "dir EB entry {addr} needs at least one invalidate");
        let was_pending = entry.invalidates_sent > 0;
        entry.invalidates_sent = count;
        if !was_pending {
            self.pending_invalidates += 1;
        }
    }

    /// Records one acknowledged invalidation for `addr`.
    ///
    /// # Returns
    ///
    /// Invalidations still outstanding for the entry.
    pub fn complete_invalidate(&mut self, addr: PhysAddr) -> usize {
        let Some(entry) = self.find_mut(addr) else {
            panic!("invalidate ack for missing dir EB entry {addr}");
        };
        assert!(
            entry.invalidates_sent > 0,
            "invalidate ack for dir EB entry {addr} with none outstanding"
        );
        entry.invalidates_sent -= 1;
        let left = entry.invalidates_sent;
        if left == 0 {
            self.pending_invalidates -= 1;
        }
        left
    }

    /// Oldest entry that has not yet been sent invalidations.
    pub fn oldest_requiring_invalidates(&self) -> Option<&DirEbEntry> {
        self.entries.iter().find(|e| e.invalidates_required())
    }

    /// True when the most recently inserted entry still needs invalidation.
    pub fn idle_work_ready(&self) -> bool {
        self.entries
            .back()
            .is_some_and(DirEbEntry::invalidates_required)
    }

    /// Buffered entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no entry is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding reservations.
    #[inline]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Configured size; `None` for the unbounded variant.
    #[inline]
    pub const fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Entries with invalidations in flight.
    #[inline]
    pub const fn pending_invalidates(&self) -> usize {
        self.pending_invalidates
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &DirEbEntry> {
        self.entries.iter()
    }
}
