//! Sharer-vector coherence state.
//!
//! A directory entry records which cores hold a copy of a block. This module provides:
//! 1. **Storage:** A fixed-capacity bitset sized to the configured core count.
//! 2. **Classification:** No/one/many sharer predicates used by every protocol.
//! 3. **Mutation:** Add, remove, and set-exclusive; the only ways membership changes.
//! 4. **Enumeration:** First/next sharer walks and "all sharers except one" lists for
//!    building multicast invalidations.
//! 5. **Bitstrings:** The most-significant-core-first text form used by checkpoints.

use std::fmt;

use crate::common::NodeId;

const WORD_BITS: usize = 64;

/// Set of cores holding a copy of one block.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct SharerSet {
    words: Vec<u64>,
    capacity: usize,
}

impl SharerSet {
    /// Creates an empty sharer set able to track `capacity` cores.
    pub fn new(capacity: usize) -> Self {
        Self {
            words: vec![0; capacity.div_ceil(WORD_BITS)],
            capacity,
        }
    }

    /// Returns the number of cores this set can track.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    fn check(&self, core: NodeId) {
        assert!(
            core < self.capacity,
            "sharer index {core} out of range for {} cores",
            self.capacity
        );
    }

    /// Returns true if `core` holds a copy.
    #[inline]
    pub fn is_sharer(&self, core: NodeId) -> bool {
        core < self.capacity && self.words[core / WORD_BITS] & (1 << (core % WORD_BITS)) != 0
    }

    /// Adds `core` to the set.
    pub fn add_sharer(&mut self, core: NodeId) {
        self.check(core);
        self.words[core / WORD_BITS] |= 1 << (core % WORD_BITS);
    }

    /// Removes `core` from the set. Removing a non-sharer is a no-op.
    pub fn remove_sharer(&mut self, core: NodeId) {
        self.check(core);
        self.words[core / WORD_BITS] &= !(1 << (core % WORD_BITS));
    }

    /// Makes `core` the only sharer.
    pub fn set_sharer(&mut self, core: NodeId) {
        self.check(core);
        self.clear();
        self.add_sharer(core);
    }

    /// Removes every sharer.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of sharers.
    #[inline]
    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// True when no core holds a copy.
    #[inline]
    pub fn no_sharers(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// True when exactly one core holds a copy.
    #[inline]
    pub fn one_sharer(&self) -> bool {
        self.count() == 1
    }

    /// True when more than one core holds a copy.
    #[inline]
    pub fn many_sharers(&self) -> bool {
        self.count() > 1
    }

    /// Lowest-index sharer, if any.
    pub fn first_sharer(&self) -> Option<NodeId> {
        self.iter().next()
    }

    /// Lowest-index sharer strictly above `after`.
    pub fn next_sharer(&self, after: NodeId) -> Option<NodeId> {
        self.iter().find(|&c| c > after)
    }

    /// Every sharer in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.capacity).filter(move |&c| self.is_sharer(c))
    }

    /// Every sharer except `exclude`, ascending.
    ///
    /// Used to build the multicast list for invalidations that must skip the
    /// requester or the core already receiving a forward.
    pub fn other_sharers(&self, exclude: Option<NodeId>) -> Vec<NodeId> {
        self.iter().filter(|&c| Some(c) != exclude).collect()
    }

    /// Renders the set as a bitstring, highest core first.
    pub fn to_bitstring(&self) -> String {
        (0..self.capacity)
            .rev()
            .map(|c| if self.is_sharer(c) { '1' } else { '0' })
            .collect()
    }

    /// Parses a highest-core-first bitstring.
    ///
    /// Strings shorter than the capacity are right-aligned. Extra leading characters are
    /// accepted only if they are `0`.
    ///
    /// # Returns
    ///
    /// The parsed set, or a static reason string on failure.
    pub fn from_bitstring(bits: &str, capacity: usize) -> Result<Self, &'static str> {
        let mut set = Self::new(capacity);
        for (core, ch) in bits.chars().rev().enumerate() {
            match ch {
                '0' => {}
                '1' if core < capacity => set.add_sharer(core),
                '1' => return Err("sharer index exceeds core count"),
                _ => return Err("bitstring may only contain '0' and '1'"),
            }
        }
        Ok(set)
    }
}

impl fmt::Debug for SharerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl fmt::Display for SharerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_bitstring())
    }
}
