//! Coherence directory.
//!
//! The directory is the persistent map from block address to sharer state for one bank.
//! This module provides:
//! 1. **Entries:** `DirEntry`, a sharer set plus a protection flag that pins the entry
//!    while a transaction is active on it.
//! 2. **Directory Trait:** Lookup, allocation, set contention, and evict-buffer access.
//! 3. **Organisations:** An infinite hash-map directory and a set-associative standard
//!    directory that victimises entries into its evict buffer.
//! 4. **Checkpoints:** JSON save/restore filtered by bank.

/// Checkpoint records and file I/O.
pub mod checkpoint;

/// Directory evict buffer.
pub mod evict_buffer;

/// Unbounded directory.
pub mod infinite;

/// Set-associative directory.
pub mod standard;

use std::collections::BTreeMap;
use std::fmt;

pub use checkpoint::CheckpointRecord;
pub use evict_buffer::{DirEbEntry, DirEvictBuffer};
pub use infinite::InfiniteDirectory;
pub use standard::StandardDirectory;

use crate::common::{CheckpointError, ConfigError, PhysAddr};
use crate::controller::BankMap;
use crate::state::SharerSet;

/// Coherence state of one tracked block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    /// Cores holding a copy.
    pub sharers: SharerSet,
    protected: bool,
}

impl DirEntry {
    /// Creates an unprotected entry.
    pub const fn new(sharers: SharerSet) -> Self {
        Self {
            sharers,
            protected: false,
        }
    }

    /// True while a transaction pins this entry.
    #[inline]
    pub const fn is_protected(&self) -> bool {
        self.protected
    }

    /// Pins or unpins the entry against victimisation.
    #[inline]
    pub fn set_protected(&mut self, protected: bool) {
        self.protected = protected;
    }
}

/// Geometry shared by every directory organisation of a bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirectoryGeometry {
    /// Number of cores tracked per entry.
    pub cores: usize,
    /// Cache block size in bytes.
    pub block_size: u64,
    /// Banks in the system.
    pub banks: usize,
    /// Bank interleave in bytes.
    pub interleave: u64,
    /// Directory evict-buffer slots.
    pub eb_size: usize,
}

/// One bank's directory.
pub trait Directory: Send + fmt::Debug {
    /// Entry for `addr`.
    fn lookup(&self, addr: PhysAddr) -> Option<&DirEntry>;

    /// Mutable entry for `addr`.
    fn lookup_mut(&mut self, addr: PhysAddr) -> Option<&mut DirEntry>;

    /// Creates an entry for `addr` with `state`.
    ///
    /// # Returns
    ///
    /// `false` if `addr` is already present or no victim could be made room for; the
    /// existing contents are never overwritten.
    fn allocate(&mut self, addr: PhysAddr, state: SharerSet) -> bool;

    /// Drops the entry for `addr`, if any.
    fn remove(&mut self, addr: PhysAddr);

    /// True if `a` and `b` compete for the same capacity.
    fn same_set(&self, a: PhysAddr, b: PhysAddr) -> bool;

    /// The directory evict buffer.
    fn evict_buffer(&self) -> &DirEvictBuffer;

    /// The directory evict buffer, mutably.
    fn evict_buffer_mut(&mut self) -> &mut DirEvictBuffer;

    /// True when the newest evict-buffer entry still needs back-invalidation.
    fn idle_work_ready(&self) -> bool {
        self.evict_buffer().idle_work_ready()
    }

    /// Number of tracked entries.
    fn len(&self) -> usize;

    /// True if no entry is tracked.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Exports every entry, sorted by address.
    fn save_checkpoint(&self) -> Vec<CheckpointRecord>;

    /// Replaces the contents with the records that `bank_map` assigns to `bank`.
    ///
    /// # Returns
    ///
    /// The number of records loaded.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError`] if a record's sharer string is malformed or it cannot
    /// be placed.
    fn load_checkpoint(
        &mut self,
        records: &[CheckpointRecord],
        bank_map: &BankMap,
        bank: usize,
    ) -> Result<usize, CheckpointError>;
}

/// Directory organisations selectable by name.
pub const DIRECTORY_NAMES: &[&str] = &["Infinite", "Standard"];

/// Builds a directory from its registered name.
///
/// # Arguments
///
/// * `name` - `"Infinite"` or `"Standard"` (case-insensitive).
/// * `params` - Organisation-specific parameters.
/// * `geometry` - Core count, block size, and bank layout.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownDirectory`] for an unknown name, or the organisation's
/// own error for a bad parameter.
pub fn create(
    name: &str,
    params: &BTreeMap<String, String>,
    geometry: DirectoryGeometry,
) -> Result<Box<dyn Directory>, ConfigError> {
    if name.eq_ignore_ascii_case("infinite") {
        Ok(Box::new(InfiniteDirectory::from_params(params, geometry)?))
    } else if name.eq_ignore_ascii_case("standard") {
        Ok(Box::new(StandardDirectory::from_params(params, geometry)?))
    } else {
        Err(ConfigError::UnknownDirectory(name.to_owned()))
    }
}

/// Parses a boolean parameter value.
pub(crate) fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    if value.eq_ignore_ascii_case("true") || value == "1" {
        Ok(true)
    } else if value.eq_ignore_ascii_case("false") || value == "0" {
        Ok(false)
    } else {
        Err(ConfigError::InvalidValue {
            key,
            value: value.to_owned(),
            reason: "expected true or false",
        })
    }
}

/// Parses a non-negative integer parameter value, accepting a `0x` prefix.
pub(crate) fn parse_usize(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    let parsed = value
        .strip_prefix("0x")
        .map_or_else(|| value.parse(), |hex| usize::from_str_radix(hex, 16));
    parsed.map_err(|_| ConfigError::InvalidValue {
        key,
        value: value.to_owned(),
        reason: "expected an unsigned integer",
    })
}
