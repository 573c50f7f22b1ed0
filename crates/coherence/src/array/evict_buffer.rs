//! Cache-array evict buffer.
//!
//! Lines evicted from the bank's data array wait here until memory acknowledges their
//! write-back. An entry is `pending` once its write-back has been issued.

use std::collections::VecDeque;

use crate::array::LineState;
use crate::common::PhysAddr;
use crate::protocol::MessageKind;

/// A line awaiting write-back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEbEntry {
    /// Block address.
    pub addr: PhysAddr,
    /// Eviction kind to send (`EvictClean`, `EvictWritable`, or `EvictDirty`).
    pub kind: MessageKind,
    /// Array state of the line when it was evicted.
    pub state: LineState,
    /// May be written back now.
    pub evictable: bool,
    /// Write-back issued; waiting for `EvictAck`.
    pub pending: bool,
}

/// Bounded FIFO of evicted array lines.
#[derive(Debug)]
pub struct CacheEvictBuffer {
    entries: VecDeque<CacheEbEntry>,
    size: usize,
    reserved: usize,
    pending: usize,
}

impl CacheEvictBuffer {
    /// Creates an empty buffer with `size` slots.
    pub fn new(size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(size),
            size,
            reserved: 0,
            pending: 0,
        }
    }

    /// Adds an evicted line, or updates the kind and state of an existing entry.
    ///
    /// # Panics
    ///
    /// Panics if a new entry would exceed the buffer size.
    pub fn alloc_entry(&mut self, addr: PhysAddr, kind: MessageKind, state: LineState) {
        assert!(kind.is_evict(), "cache EB entry for {addr} with non-evict kind {kind}");
        if let Some(existing) = self.find_mut(addr) {
            existing.kind = kind;
            existing.state = state;
            return;
        }
        assert!(
            self.entries.len() < self.size,
            "cache EB overflow allocating {addr} ({} used, size {})",
            self.entries.len(),
            self.size
        );
        self.entries.push_back(CacheEbEntry {
            addr,
            kind,
            state,
            evictable: true,
            pending: false,
        });
    }

    /// Marks the oldest evictable, non-pending entry as pending and returns a copy.
    ///
    /// # Panics
    ///
    /// Panics if no entry is ready; check [`CacheEvictBuffer::evictable_ready`] first.
    pub fn first_non_pending(&mut self) -> CacheEbEntry {
        let Some(entry) = self.entries.iter_mut().find(|e| e.evictable && !e.pending) else {
            panic!(
                "no evictable cache EB entry ({} used, {} pending)",
                self.entries.len(),
                self.pending
            );
        };
        entry.pending = true;
        self.pending += 1;
        entry.clone()
    }

    /// True if some entry can be written back now.
    pub fn evictable_ready(&self) -> bool {
        self.entries.iter().any(|e| e.evictable && !e.pending)
    }

    /// Entry for `addr`.
    pub fn find(&self, addr: PhysAddr) -> Option<&CacheEbEntry> {
        self.entries.iter().find(|e| e.addr == addr)
    }

    /// Mutable entry for `addr`.
    pub fn find_mut(&mut self, addr: PhysAddr) -> Option<&mut CacheEbEntry> {
        self.entries.iter_mut().find(|e| e.addr == addr)
    }

    /// Removes the entry for `addr`.
    ///
    /// # Panics
    ///
    /// Panics if no such entry exists.
    pub fn remove(&mut self, addr: PhysAddr) -> CacheEbEntry {
        let Some(pos) = self.entries.iter().position(|e| e.addr == addr) else {
            panic!("removing cache EB entry {addr} that does not exist");
        };
        let Some(entry) = self.entries.remove(pos) else {
            unreachable!("position {pos} was just found");
        };
        if entry.pending {
            self.pending -= 1;
        }
        entry
    }

    /// Claims `n` slots.
    ///
    /// # Panics
    ///
    /// Panics on over-reservation.
    pub fn reserve(&mut self, n: usize) {
        assert!(
            self.entries.len() + self.reserved + n <= self.size,
            "cache EB over-reserved: {} used + {} reserved + {n} > {}",
            self.entries.len(),
            self.reserved,
            self.size
        );
        self.reserved += n;
    }

    /// Releases `n` reserved slots.
    pub fn unreserve(&mut self, n: usize) {
        assert!(
            self.reserved >= n,
            "cache EB released {n} slots with only {} reserved",
            self.reserved
        );
        self.reserved -= n;
    }

    /// True if `n` more reservations fit.
    #[inline]
    pub fn has_space(&self, n: usize) -> bool {
        self.entries.len() + self.reserved + n <= self.size
    }

    /// True if used plus reserved slots reach the size.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() + self.reserved >= self.size
    }

    /// True if a slot is free now or an issued write-back will free one.
    #[inline]
    pub fn free_slots_pending(&self) -> bool {
        self.pending > 0 || self.entries.len() + self.reserved < self.size
    }

    /// Buffered lines.
    #[inline]
    pub fn used(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Outstanding reservations.
    #[inline]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Write-backs in flight.
    #[inline]
    pub const fn pending(&self) -> usize {
        self.pending
    }

    /// Configured size.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.size
    }
}
