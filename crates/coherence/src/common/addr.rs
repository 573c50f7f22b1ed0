//! Physical block addresses.
//!
//! Every structure in the coherence engine is keyed by a physical address. This module
//! provides:
//! 1. **Type Safety:** A `PhysAddr` newtype so that addresses are never confused with
//!    core indices, bank indices, or sequence numbers.
//! 2. **Block Alignment:** Helpers to reduce a byte address to its cache-block address.
//! 3. **Formatting:** Hex display used throughout trace output and panic messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A physical address in the simulated memory system.
///
/// Directory, MAF, and evict-buffer entries are always keyed by block-aligned
/// addresses; incoming messages may carry unaligned byte addresses.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PhysAddr(pub u64);

impl PhysAddr {
    /// Creates a new physical address from a raw 64-bit value.
    #[inline(always)]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Returns the raw 64-bit address value.
    #[inline(always)]
    pub const fn val(self) -> u64 {
        self.0
    }

    /// Aligns the address down to the start of its block.
    ///
    /// # Arguments
    ///
    /// * `block_size` - Block size in bytes; must be a power of two.
    ///
    /// # Returns
    ///
    /// The block-aligned address.
    #[inline]
    pub const fn block(self, block_size: u64) -> Self {
        Self(self.0 & !(block_size - 1))
    }

    /// Returns the address shifted right by `shift` bits.
    #[inline]
    pub const fn shr(self, shift: u32) -> u64 {
        self.0 >> shift
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<u64> for PhysAddr {
    fn from(addr: u64) -> Self {
        Self(addr)
    }
}
