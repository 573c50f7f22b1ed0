//! Coherence protocol policies.
//!
//! A policy decides what a bank does with each admitted work record. This module provides:
//! 1. **Policy Trait:** Seven handlers, one per record kind, plus the admission hooks the
//!    controller consults before it schedules work.
//! 2. **Shared Machinery:** `PolicyCore`, which owns the MAF, directory, evict buffers, and
//!    data array of one bank and implements the bookkeeping every protocol needs.
//! 3. **Protocols:** `NonInclusiveMESI`, written as code, and `SingleCMPRegion`, driven by
//!    a decision table.
//! 4. **Registry:** `create` builds a policy from its configured name.

/// Shared per-bank policy state.
pub mod base;

/// Non-inclusive MESI protocol.
pub mod mesi;

/// Decision-table protocol.
pub mod region;

/// Protocol decision tables.
pub mod table;

use std::collections::BTreeMap;

pub use base::PolicyCore;
pub use mesi::NonInclusiveMesi;
pub use region::SingleCmpRegion;
pub use table::{PrimaryAction, ProtocolTable, SharingState};

use crate::array::CacheEvictBuffer;
use crate::common::{CheckpointError, ConfigError, PhysAddr};
use crate::controller::process::ProcessEntry;
use crate::controller::BankMap;
use crate::directory::{CheckpointRecord, Directory};
use crate::maf::MissAddressFile;
use crate::protocol::Transport;

/// Registered policy names.
pub const POLICY_NAMES: &[&str] = &["NonInclusiveMESI", "SingleCMPRegion"];

/// A coherence protocol for one bank.
///
/// Every handler must leave exactly one [`Action`](crate::controller::process::Action)
/// on the record. Handlers may take the record's MAF token (by inserting an entry) and may
/// move its cache evict-buffer reservation onto a MAF or evict-buffer entry; every other
/// reservation is released by the controller according to the chosen action.
pub trait Policy: Send {
    /// Registered name of the protocol.
    fn name(&self) -> &'static str;

    /// Shared state.
    fn core(&self) -> &PolicyCore;

    /// Shared state, mutably.
    fn core_mut(&mut self) -> &mut PolicyCore;

    /// Handles a message from the request channel.
    fn handle_request(&mut self, process: &mut ProcessEntry);

    /// Handles a message from the snoop channel.
    fn handle_snoop(&mut self, process: &mut ProcessEntry);

    /// Handles a message from the reply channel.
    fn handle_reply(&mut self, process: &mut ProcessEntry);

    /// Re-runs a woken MAF entry.
    fn handle_wake_maf(&mut self, process: &mut ProcessEntry);

    /// Handles a cache evict-buffer write-back.
    fn handle_cache_evict(&mut self, process: &mut ProcessEntry);

    /// Handles a directory evict-buffer back-invalidation.
    fn handle_dir_evict(&mut self, process: &mut ProcessEntry);

    /// Handles a background maintenance record.
    fn handle_idle_work(&mut self, process: &mut ProcessEntry);

    /// True if the MAF and both evict buffers are empty.
    fn is_quiesced(&self) -> bool {
        self.core().is_quiesced()
    }

    /// The miss address file.
    fn maf(&self) -> &MissAddressFile {
        &self.core().maf
    }

    /// The miss address file, mutably.
    fn maf_mut(&mut self) -> &mut MissAddressFile {
        &mut self.core_mut().maf
    }

    /// The directory.
    fn directory(&self) -> &dyn Directory {
        self.core().directory.as_ref()
    }

    /// The cache evict buffer.
    fn cache_eb(&self) -> &CacheEvictBuffer {
        &self.core().cache_eb
    }

    /// True if the data array can take another eviction.
    fn array_evict_resources_available(&self) -> bool {
        self.core().array.eviction_resources_available()
    }

    /// Evict-buffer slots a message needs at admission.
    fn eb_requirements(&self, transport: &Transport) -> usize {
        self.core().eb_requirements(transport)
    }

    /// True if `n` slots fit in both evict buffers and the array can evict.
    fn eb_has_space(&self, n: usize) -> bool {
        self.core().eb_has_space(n)
    }

    /// True if `n` cache evict-buffer slots fit.
    fn cache_eb_has_space(&self, n: usize) -> bool {
        self.core().cache_eb.has_space(n)
    }

    /// True if the directory evict buffer has or will soon have a free slot.
    fn free_dir_eb_pending(&self) -> bool {
        self.core().directory.evict_buffer().free_slots_pending()
    }

    /// True if the cache evict buffer has or will soon have a free slot.
    fn free_cache_eb_pending(&self) -> bool {
        self.core().cache_eb.free_slots_pending()
    }

    /// Reserves `n` slots in both evict buffers.
    fn reserve_eb(&mut self, n: usize) {
        let core = self.core_mut();
        core.directory.evict_buffer_mut().reserve(n);
        core.cache_eb.reserve(n);
    }

    /// Releases directory and cache evict-buffer slots.
    fn unreserve_eb(&mut self, dir: usize, cache: usize) {
        let core = self.core_mut();
        core.directory.evict_buffer_mut().unreserve(dir);
        core.cache_eb.unreserve(cache);
    }

    /// Reserves `n` cache evict-buffer slots.
    fn reserve_cache_eb(&mut self, n: usize) {
        self.core_mut().cache_eb.reserve(n);
    }

    /// Releases `n` cache evict-buffer slots.
    fn unreserve_cache_eb(&mut self, n: usize) {
        self.core_mut().cache_eb.unreserve(n);
    }

    /// True if idle work should be scheduled.
    fn has_idle_work_available(&self) -> bool {
        self.core().has_idle_work_available()
    }

    /// Transport for the next idle-work record.
    fn idle_work_transport(&mut self) -> Transport {
        self.core_mut().back_invalidate_transport()
    }

    /// Transport writing back the oldest cache evict-buffer line.
    fn cache_evict_transport(&mut self) -> Transport {
        self.core_mut().cache_evict_transport()
    }

    /// Transport back-invalidating the oldest directory evict-buffer entry.
    fn dir_evict_transport(&mut self) -> Transport {
        self.core_mut().back_invalidate_transport()
    }

    /// Wakes requests parked behind `addr` once no transaction is active on it.
    fn wake_mafs(&mut self, addr: PhysAddr) {
        self.core_mut().wake_mafs(addr);
    }

    /// Exports the directory.
    fn save_checkpoint(&self) -> Vec<CheckpointRecord> {
        self.core().directory.save_checkpoint()
    }

    /// Replaces the directory with the records that belong to `bank`.
    ///
    /// # Errors
    ///
    /// Propagates [`CheckpointError`] from the directory.
    fn load_checkpoint(
        &mut self,
        records: &[CheckpointRecord],
        bank_map: &BankMap,
        bank: usize,
    ) -> Result<usize, CheckpointError> {
        self.core_mut()
            .directory
            .load_checkpoint(records, bank_map, bank)
    }
}

/// Builds a policy from its registered name.
///
/// # Arguments
///
/// * `name` - One of [`POLICY_NAMES`] (case-insensitive).
/// * `params` - Protocol-specific parameters.
/// * `core` - The bank's MAF, directory, evict buffers, and data array.
///
/// # Errors
///
/// Returns [`ConfigError::UnknownPolicy`] for an unregistered name, or
/// [`ConfigError::UnknownParameter`]/[`ConfigError::InvalidValue`] for bad parameters.
pub fn create(
    name: &str,
    params: &BTreeMap<String, String>,
    core: PolicyCore,
) -> Result<Box<dyn Policy>, ConfigError> {
    if name.eq_ignore_ascii_case("NonInclusiveMESI") {
        Ok(Box::new(NonInclusiveMesi::from_params(params, core)?))
    } else if name.eq_ignore_ascii_case("SingleCMPRegion") {
        Ok(Box::new(SingleCmpRegion::from_params(params, core)?))
    } else {
        Err(ConfigError::UnknownPolicy(name.to_owned()))
    }
}
