//! Decision-table protocol for a single chip.
//!
//! `SingleCMPRegion` keeps only directory state: the bank's data array is not consulted.
//! Every request is classified by its block's [`SharingState`] and handled according to
//! the matching [`ProtocolTable`] row:
//! 1. **Snoop:** Sent to one picked sharer, or multicast to every other sharer. The MAF
//!    entry counts the terminal acks still expected.
//! 2. **Fallback:** A sharer that no longer holds the block answers `FwdNAck`; the next
//!    candidate is tried, then memory.
//! 3. **Completion:** When the last ack arrives the directory is updated and the
//!    requester is answered from the snoop data, from memory, or directly.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, trace};

use crate::common::{ConfigError, NodeId, PhysAddr};
use crate::controller::process::{Action, ProcessEntry};
use crate::directory::parse_bool;
use crate::maf::{MafId, MafState};
use crate::policy::table::{PrimaryAction, ProtocolTable, SharingState};
use crate::policy::{Policy, PolicyCore};
use crate::protocol::{DestinationKind, FillLevel, MemoryMessage, MessageKind};
use crate::state::SharerSet;

/// Progress of one snooping transaction.
#[derive(Clone, Debug)]
struct PendingTxn {
    action: PrimaryAction,
    /// Sharers not yet tried, for serial snoops.
    candidates: Vec<NodeId>,
    /// A terminal ack carried the block.
    data_supplied: bool,
    /// The request went on to memory and the reply is awaited.
    awaiting_memory: bool,
}

/// Table-driven directory protocol.
#[derive(Debug)]
pub struct SingleCmpRegion {
    core: PolicyCore,
    table: ProtocolTable,
    /// Blocks whose lone sharer holds them writable.
    exclusive: HashSet<PhysAddr>,
    pending: HashMap<MafId, PendingTxn>,
}

impl SingleCmpRegion {
    /// Wraps the bank's structures with the protocol's table.
    pub fn new(core: PolicyCore, propagate_clean_evicts: bool) -> Self {
        Self {
            core,
            table: ProtocolTable::single_cmp_region(propagate_clean_evicts),
            exclusive: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    /// Builds the protocol from its parameter list.
    ///
    /// Accepts `propagate_clean_evicts` (alias `PropagateCE`).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownParameter`] for any other key and
    /// [`ConfigError::InvalidValue`] for a value that is not a boolean.
    pub fn from_params(
        params: &BTreeMap<String, String>,
        core: PolicyCore,
    ) -> Result<Self, ConfigError> {
        let mut propagate = false;
        for (key, value) in params {
            if key == "propagate_clean_evicts" || key.eq_ignore_ascii_case("PropagateCE") {
                propagate = parse_bool("propagate_clean_evicts", value)?;
            } else {
                return Err(ConfigError::UnknownParameter {
                    component: "SingleCMPRegion",
                    key: key.clone(),
                });
            }
        }
        Ok(Self::new(core, propagate))
    }

    /// The protocol's decision table.
    pub const fn table(&self) -> &ProtocolTable {
        &self.table
    }

    /// Sharing state of `addr` as recorded by the directory.
    pub fn sharing_state(&self, addr: PhysAddr) -> SharingState {
        match self.core.directory.lookup(addr) {
            Some(entry) => SharingState::classify(&entry.sharers, self.exclusive.contains(&addr)),
            None => SharingState::ZeroSharers,
        }
    }

    fn do_request(&mut self, process: &mut ProcessEntry, has_maf: bool) {
        let addr = self.core.block_addr(process.addr());
        let mut kind = process.transport.kind();
        if kind.is_evict() {
            return self.do_evict(process, has_maf);
        }
        let requester = self.core.requester(process);
        process.action = Action::Stall;

        if let Some(id) = self.core.maf.find(addr) {
            let state = self.core.maf.entry(id).state;
            if state < MafState::Waking {
                return self.core.stall(process, has_maf, MafState::WaitingForRequest);
            }
        }

        let buffered = self
            .core
            .directory
            .evict_buffer()
            .find(addr)
            .map(|e| (e.invalidates_pending() > 0, e.state.clone()));
        match buffered {
            Some((true, _)) => {
                return self.core.stall(process, has_maf, MafState::WaitingForEvict);
            }
            Some((false, sharers)) if self.core.directory.lookup(addr).is_none() => {
                if !self.core.directory.allocate(addr, sharers) {
                    return self.core.stall(process, has_maf, MafState::WaitingForSet);
                }
                let _ = self.core.directory.evict_buffer_mut().reclaim(addr);
            }
            _ if self.core.directory.lookup(addr).is_none() => {
                let empty = self.core.empty_sharers();
                if !self.core.directory.allocate(addr, empty) {
                    return self.core.stall(process, has_maf, MafState::WaitingForSet);
                }
            }
            _ => {}
        }

        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            panic!("bank {}: directory entry for {addr} vanished", self.core.bank);
        };
        entry.set_protected(true);
        let sharers = entry.sharers.clone();

        if kind == MessageKind::UpgradeReq && !sharers.is_sharer(requester) {
            kind = MessageKind::WriteReq;
            process.transport.message.kind = kind;
        }

        let state = self.sharing_state(addr);
        let action = *self.table.lookup(state, kind);
        let candidates = sharers.other_sharers(Some(requester));
        trace!(bank = self.core.bank, addr = %addr, %kind, %state, ?candidates, "table lookup");

        match action.snoop {
            Some(snoop) if !candidates.is_empty() => {
                let req_size = process.transport.message.req_size;
                let message = MemoryMessage::new(snoop, addr)
                    .with_size(req_size)
                    .with_ack(true, action.reply_from_snoop);
                let (transport, expected, rest) = if action.multicast {
                    let mut t = process.transport.derive(message, DestinationKind::Multicast);
                    t.dest_mut().multicast = candidates.clone();
                    (t, candidates.len(), Vec::new())
                } else {
                    let mut t = process.transport.derive(message, DestinationKind::Source);
                    let mut pool = self.core.empty_sharers();
                    for &c in &candidates {
                        pool.add_sharer(c);
                    }
                    let first = self.core.pick_sharer(&pool, t.dest().directory);
                    t.dest_mut().source = Some(first);
                    let rest = candidates.into_iter().filter(|&c| c != first).collect();
                    (t, 1, rest)
                };
                process.add_snoop(transport);
                let id = self.core.park(process, has_maf, MafState::WaitingForAck, sharers);
                self.core.maf.entry_mut(id).acks_outstanding = u32::try_from(expected).unwrap_or(u32::MAX);
                let _ = self.pending.insert(
                    id,
                    PendingTxn {
                        action,
                        candidates: rest,
                        data_supplied: false,
                        awaiting_memory: false,
                    },
                );
                process.action = Action::FwdAndWaitAck;
            }
            _ if action.forward => {
                self.forward_to_memory(process, has_maf, action, sharers);
            }
            _ => {
                // Permission only: the requester already holds the data.
                self.grant(addr, requester, kind);
                let Some(response) = action.response else {
                    panic!("bank {}: {kind} in state {state} grants nothing", self.core.bank);
                };
                let mut reply = MemoryMessage::new(response, addr).with_ack(false, false);
                reply.outstanding = -1;
                let mut reply = process.transport.derive(reply, DestinationKind::Requester);
                reply.set_fill_level(FillLevel::Directory);
                process.set_reply(reply);
                process.action = if has_maf {
                    Action::ReplyAndRemoveMaf
                } else {
                    Action::Reply
                };
            }
        }
    }

    /// Sends the request on to memory and waits for the reply.
    fn forward_to_memory(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        action: PrimaryAction,
        sharers: SharerSet,
    ) {
        let mut to_memory = process.transport.clone();
        to_memory.dest_mut().kind = DestinationKind::Memory;
        process.add_snoop(to_memory);
        let id = self.core.park(process, has_maf, MafState::WaitingForAck, sharers);
        self.core.maf.entry_mut(id).acks_outstanding = 0;
        let _ = self.pending.insert(
            id,
            PendingTxn {
                action,
                candidates: Vec::new(),
                data_supplied: false,
                awaiting_memory: true,
            },
        );
        process.action = Action::FwdAndWaitAck;
    }

    /// Records the permission granted to `requester`.
    fn grant(&mut self, addr: PhysAddr, requester: NodeId, kind: MessageKind) {
        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            panic!("bank {}: grant on untracked block {addr}", self.core.bank);
        };
        match kind {
            MessageKind::WriteReq | MessageKind::UpgradeReq => {
                entry.sharers.set_sharer(requester);
                let _ = self.exclusive.insert(addr);
            }
            _ => {
                let was_empty = entry.sharers.no_sharers();
                entry.sharers.add_sharer(requester);
                if was_empty && kind == MessageKind::ReadReq {
                    let _ = self.exclusive.insert(addr);
                } else {
                    let _ = self.exclusive.remove(&addr);
                }
            }
        }
        entry.set_protected(false);
    }

    /// Closes the transaction on `id` and answers the requester.
    fn complete(&mut self, process: &mut ProcessEntry, id: MafId, fill: FillLevel) {
        let Some(txn) = self.pending.remove(&id) else {
            panic!("bank {}: completing MAF entry {} with no transaction", self.core.bank, id.seq());
        };
        let entry = self.core.maf.entry(id);
        let (addr, kind) = (entry.addr, entry.transport.kind());
        let Some(requester) = entry.requester() else {
            panic!("bank {}: transaction on {addr} has no requester", self.core.bank);
        };
        let Some(mut response) = txn.action.response else {
            panic!("bank {}: {kind} on {addr} has no response", self.core.bank);
        };
        if kind == MessageKind::ReadReq
            && response == MessageKind::MissReplyWritable
            && self
                .core
                .directory
                .lookup(addr)
                .is_some_and(|e| !e.sharers.other_sharers(Some(requester)).is_empty())
        {
            response = MessageKind::MissReply;
        }

        let block_size = self.core.block_size_u32();
        let mut message = MemoryMessage::new(response, addr).with_ack(false, false);
        message.outstanding = -1;
        if response != MessageKind::UpgradeReply {
            message.req_size = block_size;
        }
        let mut reply = self
            .core
            .maf
            .entry(id)
            .transport
            .derive(message, DestinationKind::Requester);
        reply.set_fill_level(fill);
        process.set_reply(reply);
        process.maf = Some(id);
        process.action = Action::ReplyAndRemoveMaf;
        self.grant(addr, requester, kind);
        debug!(bank = self.core.bank, addr = %addr, %response, requester, ?fill, "transaction complete");
    }

    fn do_evict(&mut self, process: &mut ProcessEntry, has_maf: bool) {
        let addr = self.core.block_addr(process.addr());
        let kind = process.transport.kind();
        let source = self.core.requester(process);
        process.action = Action::NoAction;

        if self
            .core
            .maf
            .find_for_requester(addr, MafState::WaitingForAck, Some(source))
            .is_some()
        {
            return self.core.stall(process, has_maf, MafState::WaitingForRequest);
        }
        if has_maf {
            let _ = self.core.maf.remove(process.maf_id());
            process.maf = None;
        }

        if let Some(entry) = self.core.directory.evict_buffer_mut().find_mut(addr) {
            entry.state.remove_sharer(source);
            let drained = entry.invalidates_pending() == 0 && entry.state.no_sharers();
            let mut wake = false;
            if drained {
                let removed = self.core.directory.evict_buffer_mut().remove(addr);
                process.reservations.cache_eb += removed.cache_eb_reserved;
                if let Some(id) = self.core.maf.find_first(addr, MafState::WaitingForEvict) {
                    process.maf = Some(id);
                    wake = true;
                }
            }
            let forward = kind == MessageKind::EvictDirty || process.transport.message.evict_has_data;
            if forward {
                self.evict_to_memory(process);
            }
            process.action = match (wake, forward) {
                (true, true) => Action::FwdAndWakeEvictMaf,
                (true, false) => Action::WakeEvictMaf,
                (false, true) => Action::Forward,
                (false, false) => Action::NoAction,
            };
            return;
        }

        let is_sharer = self
            .core
            .directory
            .lookup(addr)
            .is_some_and(|e| e.sharers.is_sharer(source));
        if !is_sharer {
            // Overtaken by an invalidation; the data is stale.
            trace!(bank = self.core.bank, addr = %addr, source, "stale evict dropped");
            self.ack_evict(process);
            return;
        }

        let action = *self.table.lookup(self.sharing_state(addr), kind);
        if let Some(entry) = self.core.directory.lookup_mut(addr) {
            entry.sharers.remove_sharer(source);
            if entry.sharers.no_sharers() {
                let _ = self.exclusive.remove(&addr);
            }
        }
        if action.forward {
            self.evict_to_memory(process);
            process.action = Action::Forward;
        } else {
            self.ack_evict(process);
        }
    }

    fn evict_to_memory(&self, process: &mut ProcessEntry) {
        let mut to_memory = process.transport.clone();
        to_memory.dest_mut().kind = DestinationKind::Memory;
        to_memory.dest_mut().directory = Some(self.core.bank);
        process.add_snoop(to_memory);
    }

    fn ack_evict(&self, process: &mut ProcessEntry) {
        if process.transport.message.ack_required {
            let addr = process.addr();
            let ack = process.transport.derive(
                MemoryMessage::new(MessageKind::EvictAck, addr),
                DestinationKind::Requester,
            );
            process.add_snoop(ack);
            process.action = Action::Forward;
        } else {
            process.action = Action::NoAction;
        }
    }

    fn handle_back_invalidate_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        let dirty = process.transport.kind() == MessageKind::InvUpdateAck;
        let sharer = process.transport.dest().other;
        let _ = self.core.complete_back_invalidate(process, addr, sharer);
        if dirty {
            let mut write_back = process.transport.derive(
                MemoryMessage::new(MessageKind::EvictDirty, addr).with_size(self.core.block_size_u32()),
                DestinationKind::Memory,
            );
            write_back.message.evict_has_data = true;
            process.add_snoop(write_back);
            process.action = match process.action {
                Action::WakeEvictMaf => Action::FwdAndWakeEvictMaf,
                _ => Action::Forward,
            };
        }
    }

    fn handle_snoop_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr, id: MafId) {
        let kind = process.transport.kind();
        let Some(txn) = self.pending.get_mut(&id) else {
            panic!("bank {}: {kind} for {addr} without a snoop in flight", self.core.bank);
        };
        assert!(
            txn.action.is_terminal(kind),
            "bank {}: {kind} does not close the snoop on {addr}",
            self.core.bank
        );
        if matches!(kind, MessageKind::ReturnReply | MessageKind::InvUpdateAck) {
            txn.data_supplied = true;
        }
        let (rfs, forward, supplied) = (
            txn.action.reply_from_snoop,
            txn.action.forward,
            txn.data_supplied,
        );

        let entry = self.core.maf.entry_mut(id);
        assert!(
            entry.acks_outstanding > 0,
            "bank {}: unexpected {kind} for {addr}",
            self.core.bank
        );
        entry.acks_outstanding -= 1;
        process.maf = Some(id);
        if entry.acks_outstanding > 0 {
            process.action = Action::NoAction;
            return;
        }

        if rfs && supplied {
            self.complete(process, id, FillLevel::PeerCache);
        } else if forward {
            self.retry_at_memory(process, id);
        } else {
            self.complete(process, id, FillLevel::Directory);
        }
    }

    /// Sends the request of entry `id` to memory after the snoops failed to supply data.
    fn retry_at_memory(&mut self, process: &mut ProcessEntry, id: MafId) {
        let mut to_memory = self.core.maf.entry(id).transport.clone();
        to_memory.dest_mut().kind = DestinationKind::Memory;
        to_memory.dest_mut().source = None;
        process.add_snoop(to_memory);
        process.maf = Some(id);
        process.action = Action::Forward;
        if let Some(txn) = self.pending.get_mut(&id) {
            txn.awaiting_memory = true;
        }
    }

    fn handle_fwd_nack(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        let Some(nacker) = process.transport.dest().source.or_else(|| process.transport.dest().other)
        else {
            panic!("bank {}: FwdNAck for {addr} names no sharer", self.core.bank);
        };
        let requester = self.core.requester(process);
        let Some(id) = self
            .core
            .maf
            .find_for_requester(addr, MafState::WaitingForAck, Some(requester))
        else {
            panic!("bank {}: FwdNAck for {addr} matches no transaction", self.core.bank);
        };
        if let Some(entry) = self.core.directory.lookup_mut(addr) {
            entry.sharers.remove_sharer(nacker);
        }

        let next = self.pending.get_mut(&id).and_then(|t| {
            if t.candidates.is_empty() {
                None
            } else {
                Some(t.candidates.remove(0))
            }
        });
        match next {
            Some(sharer) => {
                let active = &self.core.maf.entry(id).transport;
                let Some(snoop) = self.pending.get(&id).and_then(|t| t.action.snoop) else {
                    panic!("bank {}: FwdNAck for {addr} without a snoop kind", self.core.bank);
                };
                let message = MemoryMessage::new(snoop, addr)
                    .with_size(active.message.req_size)
                    .with_ack(true, true);
                let mut retry = active.derive(message, DestinationKind::Source);
                retry.dest_mut().source = Some(sharer);
                process.add_snoop(retry);
                process.maf = Some(id);
                process.action = Action::Forward;
                debug!(bank = self.core.bank, addr = %addr, nacker, sharer, "snoop retried");
            }
            None => {
                self.core.maf.entry_mut(id).acks_outstanding = 0;
                self.retry_at_memory(process, id);
            }
        }
    }

    fn handle_memory_reply(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        let kind = process.transport.kind();
        let requester = self.core.requester(process);
        let Some(id) = self
            .core
            .maf
            .find_for_requester(addr, MafState::WaitingForAck, Some(requester))
        else {
            panic!("bank {}: {kind} for {addr} matches no transaction", self.core.bank);
        };
        let awaiting = self.pending.get(&id).is_some_and(|t| t.awaiting_memory);
        assert!(
            awaiting,
            "bank {}: memory reply {kind} for {addr} before the request reached memory",
            self.core.bank
        );
        self.complete(process, id, FillLevel::Memory);
    }
}

impl Policy for SingleCmpRegion {
    fn name(&self) -> &'static str {
        "SingleCMPRegion"
    }

    fn core(&self) -> &PolicyCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut PolicyCore {
        &mut self.core
    }

    fn handle_request(&mut self, process: &mut ProcessEntry) {
        self.do_request(process, false);
    }

    fn handle_snoop(&mut self, process: &mut ProcessEntry) {
        assert!(
            process.transport.kind().is_evict(),
            "bank {}: unexpected snoop {}",
            self.core.bank,
            process.transport
        );
        self.do_evict(process, false);
    }

    fn handle_reply(&mut self, process: &mut ProcessEntry) {
        let addr = self.core.block_addr(process.addr());
        let kind = process.transport.kind();
        match kind {
            MessageKind::InvalidateAck | MessageKind::InvUpdateAck | MessageKind::ReturnReply => {
                let back_invalidate = self
                    .core
                    .directory
                    .evict_buffer()
                    .find(addr)
                    .is_some_and(|e| e.invalidates_pending() > 0);
                if back_invalidate && kind != MessageKind::ReturnReply {
                    return self.handle_back_invalidate_ack(process, addr);
                }
                let requester = self.core.requester(process);
                let Some(id) = self
                    .core
                    .maf
                    .find_for_requester(addr, MafState::WaitingForAck, Some(requester))
                else {
                    panic!("bank {}: {kind} for {addr} matches no transaction", self.core.bank);
                };
                self.handle_snoop_ack(process, addr, id);
            }
            MessageKind::FwdNAck => self.handle_fwd_nack(process, addr),
            MessageKind::MissReply
            | MessageKind::MissReplyWritable
            | MessageKind::FetchReply
            | MessageKind::UpgradeReply => self.handle_memory_reply(process, addr),
            MessageKind::EvictAck => {
                let _ = self.core.cache_eb.remove(addr);
                process.action = Action::NoAction;
            }
            _ => panic!(
                "bank {}: unexpected reply {} at directory",
                self.core.bank, process.transport
            ),
        }
    }

    fn handle_wake_maf(&mut self, process: &mut ProcessEntry) {
        self.do_request(process, true);
    }

    fn handle_cache_evict(&mut self, process: &mut ProcessEntry) {
        process.add_snoop(process.transport.clone());
        process.action = Action::Forward;
    }

    fn handle_dir_evict(&mut self, process: &mut ProcessEntry) {
        assert_eq!(
            process.transport.kind(),
            MessageKind::BackInvalidate,
            "bank {}: directory evict record without a back-invalidate",
            self.core.bank
        );
        let addr = process.addr();
        let _ = self.exclusive.remove(&addr);
        process.add_snoop(process.transport.clone());
        process.action = Action::Forward;
        process.reservations.cache_eb = 0;
    }

    fn handle_idle_work(&mut self, process: &mut ProcessEntry) {
        if process.transport.kind() != MessageKind::Idle {
            return self.handle_dir_evict(process);
        }
        process.action = Action::NoAction;
        if self.core.cache_eb.evictable_ready() {
            process.transport = self.core.cache_evict_transport();
            self.handle_cache_evict(process);
        }
    }

    fn is_quiesced(&self) -> bool {
        self.core.is_quiesced() && self.pending.is_empty()
    }
}
