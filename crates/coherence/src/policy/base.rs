//! Per-bank state shared by every protocol.
//!
//! `PolicyCore` owns the structures a protocol mutates and implements the bookkeeping
//! that does not depend on the protocol:
//! 1. **Admission:** Evict-buffer requirements and space checks.
//! 2. **Parking:** Inserting or re-stating the MAF entry of a work record.
//! 3. **Maintenance:** Back-invalidation and write-back transports for the evict buffers.
//! 4. **Wake-up:** Releasing requests parked behind a finished transaction.

use std::fmt;

use tracing::debug;

use crate::array::{CacheArray, CacheEvictBuffer, LineState};
use crate::common::{NodeId, PhysAddr};
use crate::controller::process::{Action, ProcessEntry};
use crate::directory::Directory;
use crate::maf::{MafId, MafState, MissAddressFile};
use crate::protocol::{
    Destination, DestinationKind, MemoryMessage, MessageKind, TransactionTracker, Transport,
};
use crate::state::SharerSet;

/// Structures owned by one bank's policy.
pub struct PolicyCore {
    /// Index of the bank, also its node id for routing.
    pub bank: NodeId,
    /// Cache block size in bytes.
    pub block_size: u64,
    /// Cores tracked by each sharer set.
    pub cores: usize,
    /// Write back clean victims of the data array too.
    pub evict_clean: bool,
    /// In-flight transactions.
    pub maf: MissAddressFile,
    /// Sharer state.
    pub directory: Box<dyn Directory>,
    /// Array victims awaiting write-back.
    pub cache_eb: CacheEvictBuffer,
    /// The bank's data array.
    pub array: Box<dyn CacheArray>,
}

impl fmt::Debug for PolicyCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyCore")
            .field("bank", &self.bank)
            .field("maf", &self.maf)
            .field("directory", &self.directory)
            .field("cache_eb", &self.cache_eb)
            .finish_non_exhaustive()
    }
}

impl PolicyCore {
    /// Block-aligned form of `addr`.
    #[inline]
    pub const fn block_addr(&self, addr: PhysAddr) -> PhysAddr {
        addr.block(self.block_size)
    }

    /// An empty sharer set sized for this system.
    #[inline]
    pub fn empty_sharers(&self) -> SharerSet {
        SharerSet::new(self.cores)
    }

    /// True if the MAF and both evict buffers are empty.
    pub fn is_quiesced(&self) -> bool {
        self.maf.is_empty() && self.directory.evict_buffer().is_empty() && self.cache_eb.is_empty()
    }

    /// Evict-buffer slots needed to admit `transport`.
    ///
    /// Evictions never allocate, so they need none; every other message may allocate a
    /// directory entry and a data-array line and needs one slot in each buffer.
    pub fn eb_requirements(&self, transport: &Transport) -> usize {
        usize::from(!transport.kind().is_evict())
    }

    /// True if `n` slots fit in both evict buffers and the array can evict.
    pub fn eb_has_space(&self, n: usize) -> bool {
        self.directory.evict_buffer().has_space(n)
            && self.cache_eb.has_space(n)
            && self.array.eviction_resources_available()
    }

    /// True if a cache write-back or a directory back-invalidation is waiting.
    pub fn has_idle_work_available(&self) -> bool {
        if self.cache_eb.evictable_ready() {
            true
        } else if !self.cache_eb.is_full() {
            self.directory.idle_work_ready() || self.array.eviction_pressure()
        } else {
            false
        }
    }

    /// Parks the record's transaction in the MAF in `state`.
    ///
    /// A record that already owns an entry (`has_maf`) moves it to `state` and refreshes
    /// its transport; otherwise the record's MAF token is committed into a new entry.
    ///
    /// # Returns
    ///
    /// The id of the entry, also stored on the record.
    ///
    /// # Panics
    ///
    /// Panics if a new entry is needed and the record holds no MAF token.
    pub fn park(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        state: MafState,
        block_state: SharerSet,
    ) -> MafId {
        let addr = self.block_addr(process.addr());
        if has_maf {
            let id = process.maf_id();
            self.maf.entry_mut(id).transport = process.transport.clone();
            self.maf.set_state(id, state);
            return id;
        }
        let Some(token) = process.reservations.maf.take() else {
            panic!(
                "bank {}: {process} parked as {state:?} without a MAF reservation",
                self.bank
            );
        };
        let id = self.maf.insert(token, process.transport.clone(), addr, state, block_state);
        process.maf = Some(id);
        id
    }

    /// Parks the record with an empty working state and sets `Stall`.
    pub fn stall(&mut self, process: &mut ProcessEntry, has_maf: bool, state: MafState) {
        let sharers = self.empty_sharers();
        let _ = self.park(process, has_maf, state, sharers);
        process.action = Action::Stall;
        debug!(bank = self.bank, addr = %process.addr(), ?state, "request stalled");
    }

    /// Moves the cache evict-buffer reservation of the record onto its MAF entry.
    pub fn park_cache_eb(&mut self, process: &mut ProcessEntry) {
        let id = process.maf_id();
        self.maf.entry_mut(id).cache_eb_reserved = process.reservations.cache_eb;
        process.reservations.cache_eb = 0;
    }

    /// Returns the cache evict-buffer reservation parked on `id` to the record.
    pub fn recover_cache_eb(&mut self, process: &mut ProcessEntry, id: MafId) {
        let entry = self.maf.entry_mut(id);
        if entry.cache_eb_reserved > 0 {
            process.reservations.cache_eb += entry.cache_eb_reserved;
            entry.cache_eb_reserved = 0;
        }
    }

    /// Returns the cache evict-buffer reservation parked on the directory EB entry.
    pub fn recover_dir_eb_reservation(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        if let Some(entry) = self.directory.evict_buffer_mut().find_mut(addr) {
            process.reservations.cache_eb += entry.cache_eb_reserved;
            entry.cache_eb_reserved = 0;
        }
    }

    /// Records a back-invalidation ack from `sharer` for a directory EB entry.
    ///
    /// When the last ack arrives the entry is freed, its parked reservation returns to
    /// the record, and a request waiting on the eviction is linked for wake-up.
    ///
    /// # Returns
    ///
    /// `true` if the entry was freed.
    ///
    /// # Panics
    ///
    /// Panics if `addr` has no directory EB entry, or if sharers remain once every
    /// invalidation is acknowledged.
    pub fn complete_back_invalidate(
        &mut self,
        process: &mut ProcessEntry,
        addr: PhysAddr,
        sharer: Option<NodeId>,
    ) -> bool {
        let bank = self.bank;
        let eb = self.directory.evict_buffer_mut();
        let Some(entry) = eb.find_mut(addr) else {
            panic!("bank {bank}: invalidate ack for {addr} without a directory EB entry");
        };
        if let Some(core) = sharer {
            if entry.state.is_sharer(core) {
                entry.state.remove_sharer(core);
            }
        }
        if eb.complete_invalidate(addr) > 0 {
            return false;
        }
        self.release_dir_eb_entry(process, addr);
        true
    }

    /// Frees a drained directory EB entry and links any request waiting on it.
    ///
    /// Sets `WakeEvictMaf` if a request was waiting, `NoAction` otherwise.
    pub fn release_dir_eb_entry(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        let entry = self.directory.evict_buffer_mut().remove(addr);
        assert!(
            entry.state.no_sharers(),
            "bank {}: dir EB entry {addr} drained with sharers {}",
            self.bank,
            entry.state
        );
        process.reservations.cache_eb += entry.cache_eb_reserved;
        debug!(bank = self.bank, addr = %addr, "dir EB entry drained");
        match self.maf.find_first(addr, MafState::WaitingForEvict) {
            Some(id) => {
                process.maf = Some(id);
                process.action = Action::WakeEvictMaf;
            }
            None => process.action = Action::NoAction,
        }
    }

    /// Transport back-invalidating every sharer of the oldest directory EB entry that
    /// has not been invalidated yet.
    ///
    /// Records the invalidations as pending and parks one cache evict-buffer slot on
    /// the entry for a dirty copy that may come back. Returns an idle transport when no
    /// entry needs invalidation.
    pub fn back_invalidate_transport(&mut self) -> Transport {
        let eb = self.directory.evict_buffer_mut();
        let Some(entry) = eb.oldest_requiring_invalidates() else {
            return Transport::idle();
        };
        let addr = entry.addr;
        let sharers = entry.state.other_sharers(None);
        eb.set_invalidates_pending(addr, sharers.len());
        if let Some(entry) = eb.find_mut(addr) {
            entry.cache_eb_reserved = 1;
        }

        let mut dest = Destination::new(DestinationKind::Multicast);
        dest.multicast = sharers;
        dest.directory = Some(self.bank);
        debug!(bank = self.bank, addr = %addr, targets = ?dest.multicast, "back-invalidate");
        Transport {
            message: MemoryMessage::new(MessageKind::BackInvalidate, addr),
            destination: Some(dest),
            tracker: Some(self.tracker("BackInvalidate")),
        }
    }

    /// Transport writing back the oldest evictable cache EB line to memory.
    ///
    /// # Panics
    ///
    /// Panics if no line is ready; check [`CacheEvictBuffer::evictable_ready`] first.
    pub fn cache_evict_transport(&mut self) -> Transport {
        let entry = self.cache_eb.first_non_pending();
        let mut message = MemoryMessage::new(entry.kind, entry.addr)
            .with_size(self.block_size_u32())
            .with_ack(true, false);
        message.evict_has_data = entry.kind == MessageKind::EvictDirty;

        let mut dest = Destination::new(DestinationKind::Memory);
        dest.directory = Some(self.bank);
        Transport {
            message,
            destination: Some(dest),
            tracker: Some(self.tracker("Evict")),
        }
    }

    /// Wakes requests parked behind `addr` unless a transaction on it is still active.
    ///
    /// Unprotects the directory entry, then wakes every `WaitingForRequest` entry for
    /// the address and every `WaitingForSet` entry contending for its set.
    pub fn wake_mafs(&mut self, addr: PhysAddr) {
        let addr = self.block_addr(addr);
        if self.maf.find_first(addr, MafState::WaitingForAck).is_some() {
            return;
        }
        if let Some(entry) = self.directory.lookup_mut(addr) {
            entry.set_protected(false);
        }
        let waiters: Vec<MafId> = self
            .maf
            .iter()
            .filter(|e| {
                (e.state == MafState::WaitingForRequest && e.addr == addr)
                    || (e.state == MafState::WaitingForSet && self.directory.same_set(addr, e.addr))
            })
            .map(|e| e.id)
            .collect();
        for id in waiters {
            self.maf.wake(id);
        }
    }

    /// Sharer to service a forward: the directory's own node if it shares the block,
    /// otherwise the lowest-index sharer.
    ///
    /// # Panics
    ///
    /// Panics if `sharers` is empty.
    pub fn pick_sharer(&self, sharers: &SharerSet, directory: Option<NodeId>) -> NodeId {
        if let Some(node) = directory.filter(|&n| n < sharers.capacity() && sharers.is_sharer(n)) {
            return node;
        }
        match sharers.first_sharer() {
            Some(node) => node,
            None => panic!("bank {}: no sharer to pick from {sharers}", self.bank),
        }
    }

    /// Places an array victim in the cache evict buffer if it must be written back.
    ///
    /// # Returns
    ///
    /// `true` if the victim was buffered.
    pub fn evict_cache_block(&mut self, victim: (PhysAddr, LineState)) -> bool {
        let (addr, state) = victim;
        let kind = match state {
            LineState::Invalid => return false,
            LineState::Modified => MessageKind::EvictDirty,
            LineState::Exclusive => MessageKind::EvictWritable,
            LineState::Shared => MessageKind::EvictClean,
        };
        if self.evict_clean || kind == MessageKind::EvictDirty {
            self.cache_eb.alloc_entry(addr, kind, state);
            debug!(bank = self.bank, addr = %addr, %kind, "array victim buffered");
            return true;
        }
        false
    }

    /// Allocates `addr` in the data array in `state`, buffering any victim.
    pub fn fill_array(&mut self, addr: PhysAddr, state: LineState) {
        if let Some(victim) = self.array.allocate(addr) {
            let _ = self.evict_cache_block(victim);
        }
        self.array.set_state(addr, state);
    }

    /// Requesting core named by the record's transport.
    ///
    /// # Panics
    ///
    /// Panics if the transport names no requester.
    pub fn requester(&self, process: &ProcessEntry) -> NodeId {
        match process.transport.requester() {
            Some(core) => core,
            None => panic!("bank {}: {process} names no requester", self.bank),
        }
    }

    /// Block size as carried in message sizes.
    pub fn block_size_u32(&self) -> u32 {
        u32::try_from(self.block_size).unwrap_or(u32::MAX)
    }

    fn tracker(&self, source: &'static str) -> TransactionTracker {
        TransactionTracker {
            bank: Some(self.bank),
            fill_level: None,
            source: Some(source),
        }
    }
}
