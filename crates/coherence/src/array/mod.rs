//! Bank data array interface.
//!
//! The policy consults the bank's own data array (the shared last-level slice) through
//! the [`CacheArray`] trait; the array's replacement and timing are not modelled here.
//! This module provides:
//! 1. **Line State:** The MESI state of a line held by the bank.
//! 2. **Array Trait:** Lookup, allocation with victim reporting, and eviction hooks.
//! 3. **Stock Arrays:** A tagless array that never holds data (pure directory) and an
//!    unbounded array that never evicts.
//! 4. **Evict Buffer:** Lines evicted from the array awaiting write-back.

/// Cache-array evict buffer.
pub mod evict_buffer;

use std::collections::HashMap;

pub use evict_buffer::{CacheEbEntry, CacheEvictBuffer};

use crate::common::{ConfigError, PhysAddr};

/// MESI state of a line in the bank's data array.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum LineState {
    /// Not present.
    #[default]
    Invalid,
    /// Clean copy; other caches may share it.
    Shared,
    /// Clean copy; no core above holds it writable.
    Exclusive,
    /// Dirty copy.
    Modified,
}

impl LineState {
    /// True for every state except `Invalid`.
    #[inline]
    pub const fn is_valid(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

/// The bank's data array as seen by a coherence policy.
pub trait CacheArray: Send {
    /// State of the line holding `addr`.
    fn state(&self, addr: PhysAddr) -> LineState;

    /// Sets the state of a present line.
    fn set_state(&mut self, addr: PhysAddr, state: LineState);

    /// Allocates a line for `addr` in state `Invalid`.
    ///
    /// # Returns
    ///
    /// The displaced line, if a valid one had to be evicted.
    fn allocate(&mut self, addr: PhysAddr) -> Option<(PhysAddr, LineState)>;

    /// Drops the line holding `addr`.
    fn invalidate(&mut self, addr: PhysAddr);

    /// Replacement-policy hook for a hit on `addr`.
    fn record_access(&mut self, _addr: PhysAddr) {}

    /// True when the array wants lines evicted ahead of demand.
    fn eviction_pressure(&self) -> bool {
        false
    }

    /// Picks and removes a line to evict ahead of demand.
    fn preemptive_eviction(&mut self) -> Option<(PhysAddr, LineState)> {
        None
    }

    /// True when the array can accept an allocation that displaces a line.
    fn eviction_resources_available(&self) -> bool {
        true
    }
}

/// Array with no storage; every lookup misses.
#[derive(Debug, Default)]
pub struct TaglessArray;

impl CacheArray for TaglessArray {
    fn state(&self, _addr: PhysAddr) -> LineState {
        LineState::Invalid
    }

    fn set_state(&mut self, _addr: PhysAddr, _state: LineState) {}

    fn allocate(&mut self, _addr: PhysAddr) -> Option<(PhysAddr, LineState)> {
        None
    }

    fn invalidate(&mut self, _addr: PhysAddr) {}
}

/// Array that holds every line it is given and never evicts.
#[derive(Debug, Default)]
pub struct InfiniteArray {
    lines: HashMap<PhysAddr, LineState>,
}

impl InfiniteArray {
    /// Creates an empty array.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of valid lines.
    pub fn len(&self) -> usize {
        self.lines.values().filter(|s| s.is_valid()).count()
    }

    /// True if no line is valid.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheArray for InfiniteArray {
    fn state(&self, addr: PhysAddr) -> LineState {
        self.lines.get(&addr).copied().unwrap_or_default()
    }

    fn set_state(&mut self, addr: PhysAddr, state: LineState) {
        if state.is_valid() {
            let _ = self.lines.insert(addr, state);
        } else {
            let _ = self.lines.remove(&addr);
        }
    }

    fn allocate(&mut self, addr: PhysAddr) -> Option<(PhysAddr, LineState)> {
        let _ = self.lines.entry(addr).or_insert(LineState::Invalid);
        None
    }

    fn invalidate(&mut self, addr: PhysAddr) {
        let _ = self.lines.remove(&addr);
    }
}

/// Array organisations selectable by name.
pub const ARRAY_NAMES: &[&str] = &["Tagless", "Infinite"];

/// Builds an array from its registered name.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidValue`] if `name` is not in [`ARRAY_NAMES`].
pub fn create(name: &str) -> Result<Box<dyn CacheArray>, ConfigError> {
    match name {
        "Tagless" | "tagless" => Ok(Box::new(TaglessArray)),
        "Infinite" | "infinite" => Ok(Box::new(InfiniteArray::new())),
        other => Err(ConfigError::InvalidValue {
            key: "array",
            value: other.to_owned(),
            reason: "expected Tagless or Infinite",
        }),
    }
}
