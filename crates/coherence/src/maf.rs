//! Miss Address File.
//!
//! The MAF tracks every in-flight transaction of a bank and every request parked behind
//! one. It provides:
//! 1. **Admission:** A reservation token claimed before a record enters the pipeline and
//!    either committed by `insert` or released by `unreserve`.
//! 2. **Serialization:** Address/state lookups that let the policy detect conflicts and
//!    queue a request behind the active one.
//! 3. **FCFS Wake:** Waiters are woken and claimed strictly in arrival order.
//! 4. **Region Accounting:** Per-region requester counts for protocols that decide between
//!    serial and parallel service.
//!
//! Capacity invariant: `len() + reserved() <= capacity()` after every operation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use tracing::debug;

use crate::common::{NodeId, PhysAddr};
use crate::protocol::Transport;
use crate::state::SharerSet;

/// Arrival sequence number of a MAF entry. Lower ids arrived earlier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MafId(u64);

impl MafId {
    /// Raw sequence number.
    #[inline]
    pub const fn seq(self) -> u64 {
        self.0
    }
}

/// State of a MAF entry.
///
/// The declaration order is significant: [`MissAddressFile::find`] returns the entry
/// with the lowest state for an address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MafState {
    /// Parked until a directory set has a free way.
    WaitingForSet,
    /// Parked behind another transaction on the same address.
    WaitingForRequest,
    /// Parked until an eviction of the same address completes.
    WaitingForEvict,
    /// Active; waiting for the terminal acknowledgement.
    WaitingForAck,
    /// Ready to re-enter the pipeline.
    Waking,
    /// Claimed by a work record and in the pipeline.
    InPipeline,
    /// Waiting for a revocation to finish.
    WaitingForRevoke,
}

/// One tracked transaction.
#[derive(Clone, Debug)]
pub struct MafEntry {
    /// Arrival sequence id.
    pub id: MafId,
    /// Block address.
    pub addr: PhysAddr,
    /// Current state.
    pub state: MafState,
    /// The message that created this entry.
    pub transport: Transport,
    /// Working copy of the sharer state.
    pub block_state: SharerSet,
    /// Cache-EB reservations parked on this entry until the transaction completes.
    pub cache_eb_reserved: usize,
    /// Acknowledgements still expected.
    pub acks_outstanding: u32,
}

impl MafEntry {
    /// Requesting core of the transaction, if any.
    #[inline]
    pub fn requester(&self) -> Option<NodeId> {
        self.transport.requester()
    }
}

/// Admission token for one MAF slot.
///
/// Obtained from [`MissAddressFile::reserve`]; must be passed to either
/// [`MissAddressFile::insert`] or [`MissAddressFile::unreserve`].
#[must_use = "a MAF reservation must be inserted or unreserved"]
#[derive(Debug, PartialEq, Eq)]
pub struct MafReservation {
    _slot: (),
}

type RegionFn = Box<dyn Fn(PhysAddr) -> PhysAddr + Send>;

/// Bounded multiset of in-flight transactions.
pub struct MissAddressFile {
    entries: BTreeMap<MafId, MafEntry>,
    next_id: u64,
    size: usize,
    reserved: usize,
    region_fn: RegionFn,
    regions: HashMap<PhysAddr, HashMap<Option<NodeId>, usize>>,
}

impl fmt::Debug for MissAddressFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MissAddressFile")
            .field("size", &self.size)
            .field("active", &self.entries.len())
            .field("reserved", &self.reserved)
            .field("entries", &self.entries.values().map(|e| (e.addr, e.state)).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl MissAddressFile {
    /// Creates an empty MAF with `size` slots and exact-address regions.
    pub fn new(size: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
            size,
            reserved: 0,
            region_fn: Box::new(|a| a),
            regions: HashMap::new(),
        }
    }

    /// Replaces the region grouping function.
    ///
    /// # Panics
    ///
    /// Panics if entries are already tracked, since their region counts would be lost.
    pub fn set_region_fn(&mut self, f: impl Fn(PhysAddr) -> PhysAddr + Send + 'static) {
        assert!(self.entries.is_empty(), "region function changed on a non-empty MAF");
        self.region_fn = Box::new(f);
    }

    /// Claims a slot.
    ///
    /// # Panics
    ///
    /// Panics if the MAF is full; callers check [`MissAddressFile::is_full`] first.
    pub fn reserve(&mut self) -> MafReservation {
        assert!(
            self.entries.len() + self.reserved < self.size,
            "MAF over-reserved: {} active + {} reserved >= {}",
            self.entries.len(),
            self.reserved,
            self.size
        );
        self.reserved += 1;
        MafReservation { _slot: () }
    }

    /// Releases an unused reservation.
    pub fn unreserve(&mut self, token: MafReservation) {
        let MafReservation { _slot: () } = token;
        assert!(self.reserved > 0, "MAF unreserve with no reservation outstanding");
        self.reserved -= 1;
    }

    /// Commits a reservation into a new entry.
    ///
    /// # Arguments
    ///
    /// * `token` - Reservation being committed.
    /// * `transport` - Message that owns the entry.
    /// * `addr` - Block address.
    /// * `state` - Initial state.
    /// * `block_state` - Working copy of the sharer state.
    ///
    /// # Returns
    ///
    /// The arrival id of the new entry.
    pub fn insert(
        &mut self,
        token: MafReservation,
        transport: Transport,
        addr: PhysAddr,
        state: MafState,
        block_state: SharerSet,
    ) -> MafId {
        self.unreserve(token);
        let id = MafId(self.next_id);
        self.next_id += 1;

        let requester = transport.requester();
        *self
            .regions
            .entry((self.region_fn)(addr))
            .or_default()
            .entry(requester)
            .or_insert(0) += 1;

        debug!(addr = %addr, ?state, seq = id.0, kind = %transport.kind(), "maf insert");
        let _ = self.entries.insert(
            id,
            MafEntry {
                id,
                addr,
                state,
                transport,
                block_state,
                cache_eb_reserved: 0,
                acks_outstanding: 0,
            },
        );
        debug_assert!(self.entries.len() + self.reserved <= self.size);
        id
    }

    /// Entry by id.
    #[inline]
    pub fn get(&self, id: MafId) -> Option<&MafEntry> {
        self.entries.get(&id)
    }

    /// Mutable entry by id.
    #[inline]
    pub fn get_mut(&mut self, id: MafId) -> Option<&mut MafEntry> {
        self.entries.get_mut(&id)
    }

    /// Entry by id.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not exist.
    pub fn entry(&self, id: MafId) -> &MafEntry {
        match self.entries.get(&id) {
            Some(e) => e,
            None => panic!("MAF entry {} does not exist", id.0),
        }
    }

    /// Mutable entry by id. Panics like [`MissAddressFile::entry`].
    pub fn entry_mut(&mut self, id: MafId) -> &mut MafEntry {
        match self.entries.get_mut(&id) {
            Some(e) => e,
            None => panic!("MAF entry {} does not exist", id.0),
        }
    }

    /// Entry for `addr` with the lowest state; ties go to the earliest arrival.
    pub fn find(&self, addr: PhysAddr) -> Option<MafId> {
        self.entries
            .values()
            .filter(|e| e.addr == addr)
            .min_by_key(|e| (e.state, e.id))
            .map(|e| e.id)
    }

    /// Earliest entry for `addr` in `state`.
    pub fn find_first(&self, addr: PhysAddr, state: MafState) -> Option<MafId> {
        self.entries
            .values()
            .find(|e| e.addr == addr && e.state == state)
            .map(|e| e.id)
    }

    /// Every entry for `addr` in `state`, in arrival order.
    pub fn find_all(&self, addr: PhysAddr, state: MafState) -> Vec<MafId> {
        self.entries
            .values()
            .filter(|e| e.addr == addr && e.state == state)
            .map(|e| e.id)
            .collect()
    }

    /// Earliest `state` entry for `addr` whose requester is `requester`.
    pub fn find_for_requester(
        &self,
        addr: PhysAddr,
        state: MafState,
        requester: Option<NodeId>,
    ) -> Option<MafId> {
        self.entries
            .values()
            .find(|e| e.addr == addr && e.state == state && e.requester() == requester)
            .map(|e| e.id)
    }

    /// Removes an entry.
    ///
    /// # Panics
    ///
    /// Panics if the entry does not exist.
    pub fn remove(&mut self, id: MafId) -> MafEntry {
        let Some(entry) = self.entries.remove(&id) else {
            panic!("removing MAF entry {} that does not exist", id.0);
        };
        let region = (self.region_fn)(entry.addr);
        let requester = entry.requester();
        let Some(counts) = self.regions.get_mut(&region) else {
            panic!("MAF region {region} missing while removing {}", entry.addr);
        };
        match counts.get_mut(&requester) {
            Some(n) if *n > 1 => *n -= 1,
            Some(_) => {
                let _ = counts.remove(&requester);
            }
            None => panic!("MAF region {region} has no count for requester {requester:?}"),
        }
        if counts.is_empty() {
            let _ = self.regions.remove(&region);
        }
        debug!(addr = %entry.addr, seq = id.0, "maf remove");
        entry
    }

    /// Removes the `WaitingForAck` entry of `requester` for `addr`.
    ///
    /// # Panics
    ///
    /// Panics if there is no such entry.
    pub fn remove_first(&mut self, addr: PhysAddr, requester: NodeId) -> MafEntry {
        let Some(id) = self.find_for_requester(addr, MafState::WaitingForAck, Some(requester))
        else {
            panic!("no MAF entry for {addr} from core {requester} waiting for ack");
        };
        self.remove(id)
    }

    /// Sets the state of an entry.
    pub fn set_state(&mut self, id: MafId, state: MafState) {
        let entry = self.entry_mut(id);
        debug!(addr = %entry.addr, seq = id.0, from = ?entry.state, to = ?state, "maf transition");
        entry.state = state;
    }

    /// Marks an entry ready to re-enter the pipeline.
    pub fn wake(&mut self, id: MafId) {
        self.set_state(id, MafState::Waking);
    }

    /// Wakes an entry that waited on an eviction, and every request parked behind the
    /// same address.
    pub fn wake_after_evict(&mut self, id: MafId) {
        let addr = self.entry(id).addr;
        self.wake(id);
        for waiter in self.find_all(addr, MafState::WaitingForRequest) {
            self.wake(waiter);
        }
    }

    /// True if any entry is `Waking`.
    pub fn has_waking_entry(&self) -> bool {
        self.entries.values().any(|e| e.state == MafState::Waking)
    }

    /// Oldest `Waking` entry, not yet claimed.
    pub fn peek_waking(&self) -> Option<&MafEntry> {
        self.entries.values().find(|e| e.state == MafState::Waking)
    }

    /// Claims the oldest `Waking` entry by moving it to `InPipeline`.
    pub fn take_waking(&mut self) -> Option<MafId> {
        let id = self.peek_waking()?.id;
        self.set_state(id, MafState::InPipeline);
        Some(id)
    }

    /// True if requesters other than `requester` have entries in the region of `addr`.
    pub fn other_region_requesters(&self, addr: PhysAddr, requester: NodeId) -> bool {
        let Some(counts) = self.regions.get(&(self.region_fn)(addr)) else {
            return false;
        };
        match counts.len() {
            0 => false,
            1 => !counts.contains_key(&Some(requester)),
            _ => true,
        }
    }

    /// Number of requesters with entries in the region of `addr`.
    pub fn region_requesters(&self, addr: PhysAddr) -> usize {
        self.regions
            .get(&(self.region_fn)(addr))
            .map_or(0, HashMap::len)
    }

    /// True if no slot is free for a new reservation.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.entries.len() + self.reserved >= self.size
    }

    /// True if there are no entries and no reservations.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.reserved == 0
    }

    /// Active entries.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Outstanding reservations.
    #[inline]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Configured size.
    #[inline]
    pub const fn capacity(&self) -> usize {
        self.size
    }

    /// Entries in arrival order.
    pub fn iter(&self) -> impl Iterator<Item = &MafEntry> {
        self.entries.values()
    }
}
