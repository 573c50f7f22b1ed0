//! Address-to-bank interleaving.

use crate::common::{ConfigError, NodeId, PhysAddr};

/// Maps block addresses onto banks.
///
/// The bank of an address is `((addr >> log2(interleave)) ^ (addr >> skew_shift)) & (banks - 1)`,
/// where the skew term is present only when `skew_shift > 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BankMap {
    banks: usize,
    shift: u32,
    skew_shift: u32,
    mask: u64,
}

impl BankMap {
    /// Builds a map for `banks` banks interleaved every `interleave` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotPowerOfTwo`] if `banks` or `interleave` is zero or not a
    /// power of two.
    pub fn new(banks: usize, interleave: u64, skew_shift: u32) -> Result<Self, ConfigError> {
        if !banks.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "banks",
                value: banks as u64,
            });
        }
        if !interleave.is_power_of_two() {
            return Err(ConfigError::NotPowerOfTwo {
                key: "interleave",
                value: interleave,
            });
        }
        Ok(Self {
            banks,
            shift: interleave.trailing_zeros(),
            skew_shift,
            mask: banks as u64 - 1,
        })
    }

    /// A map that sends every address to bank 0.
    pub const fn single() -> Self {
        Self {
            banks: 1,
            shift: 0,
            skew_shift: 0,
            mask: 0,
        }
    }

    /// Bank owning `addr`.
    #[inline]
    pub const fn bank_of(&self, addr: PhysAddr) -> NodeId {
        let a = addr.val();
        let skewed = if self.skew_shift > 0 {
            (a >> self.shift) ^ (a >> self.skew_shift)
        } else {
            a >> self.shift
        };
        (skewed & self.mask) as NodeId
    }

    /// Number of banks.
    #[inline]
    pub const fn banks(&self) -> usize {
        self.banks
    }

    /// log2 of the interleave.
    #[inline]
    pub const fn shift(&self) -> u32 {
        self.shift
    }
}
