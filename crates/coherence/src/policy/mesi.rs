//! Non-inclusive MESI directory protocol.
//!
//! The bank's data array is a victim-style cache beside the directory: it may hold a block
//! that no core has, and a core may hold a block the array does not. Requests are served
//! from the array when it has a clean copy no core can have modified, forwarded to a
//! sharer otherwise, and sent to memory when no on-chip copy exists.
//!
//! The handlers are organised as:
//! 1. **Requests:** MAF conflict resolution, directory/array allocation, and the
//!    read/write/upgrade/non-allocating-store decision.
//! 2. **Evictions:** Sharer removal, dirty-data absorption, and evict-buffer drain.
//! 3. **Replies:** Terminal acks, memory replies, negative acks, and write-back acks.
//! 4. **Maintenance:** Back-invalidation, write-back, and preemptive array eviction.

use std::collections::BTreeMap;

use tracing::{debug, trace, warn};

use crate::array::LineState;
use crate::common::{ConfigError, PhysAddr};
use crate::controller::process::{Action, ProcessEntry};
use crate::maf::{MafId, MafState};
use crate::policy::{Policy, PolicyCore};
use crate::protocol::{DestinationKind, FillLevel, MemoryMessage, MessageKind};
use crate::state::SharerSet;

/// The reference protocol.
#[derive(Debug)]
pub struct NonInclusiveMesi {
    core: PolicyCore,
    dir_idle_turn: bool,
}

impl NonInclusiveMesi {
    /// Wraps the bank's structures.
    pub fn new(core: PolicyCore) -> Self {
        Self {
            core,
            dir_idle_turn: false,
        }
    }

    /// Builds the protocol from its parameter list. It takes no parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownParameter`] for any key.
    pub fn from_params(
        params: &BTreeMap<String, String>,
        core: PolicyCore,
    ) -> Result<Self, ConfigError> {
        if let Some(key) = params.keys().next() {
            return Err(ConfigError::UnknownParameter {
                component: "NonInclusiveMESI",
                key: key.clone(),
            });
        }
        Ok(Self::new(core))
    }

    fn do_request(&mut self, process: &mut ProcessEntry, has_maf: bool) {
        let addr = self.core.block_addr(process.addr());
        let mut req = process.transport.kind();
        let requester = self.core.requester(process);
        process.action = Action::Stall;

        let mut maf_waiting = false;
        if let Some(id) = self.core.maf.find(addr) {
            let entry = self.core.maf.entry(id);
            let (state, active_kind) = (entry.state, entry.transport.kind());
            match state {
                MafState::WaitingForSet | MafState::WaitingForEvict if req.is_evict() => {
                    return self.do_evict(process, has_maf);
                }
                MafState::WaitingForSet => {
                    return self.core.stall(process, has_maf, MafState::WaitingForSet);
                }
                MafState::WaitingForEvict | MafState::WaitingForRequest => {
                    return self.core.stall(process, has_maf, MafState::WaitingForRequest);
                }
                MafState::WaitingForAck => {
                    if req.is_write_like() || active_kind.is_write_like() {
                        return self.core.stall(process, has_maf, MafState::WaitingForRequest);
                    }
                    maf_waiting = true;
                }
                MafState::Waking | MafState::InPipeline | MafState::WaitingForRevoke => {}
            }
        }

        if req.is_evict() {
            return self.do_evict(process, has_maf);
        }

        if maf_waiting
            && req == MessageKind::FetchReq
            && self
                .core
                .maf
                .find_for_requester(addr, MafState::WaitingForAck, Some(requester))
                .is_some()
        {
            debug!(bank = self.core.bank, addr = %addr, requester, "redundant fetch dropped");
            process.action = if has_maf {
                Action::RemoveMaf
            } else {
                Action::NoAction
            };
            return;
        }

        let buffered = self
            .core
            .directory
            .evict_buffer()
            .find(addr)
            .map(|e| (e.invalidates_pending() > 0, e.state.clone()));
        if let Some((true, _)) = buffered {
            return self.core.stall(process, has_maf, MafState::WaitingForEvict);
        }

        if self.core.directory.lookup(addr).is_none() {
            if let Some((_, sharers)) = buffered {
                if !self.core.directory.allocate(addr, sharers) {
                    trace!(bank = self.core.bank, addr = %addr, "no way to restore buffered entry");
                    return self.core.stall(process, has_maf, MafState::WaitingForSet);
                }
                let _ = self.core.directory.evict_buffer_mut().reclaim(addr);
            } else if req != MessageKind::NonAllocatingStoreReq {
                let empty = self.core.empty_sharers();
                if !self.core.directory.allocate(addr, empty) {
                    trace!(bank = self.core.bank, addr = %addr, "no way for new entry");
                    return self.core.stall(process, has_maf, MafState::WaitingForSet);
                }
            }
        }

        let mut line = self.core.array.state(addr);
        if !line.is_valid() {
            if let Some(entry) = self.core.cache_eb.find(addr) {
                if entry.pending {
                    return self.core.stall(process, has_maf, MafState::WaitingForEvict);
                }
                let restored = self.core.cache_eb.remove(addr).state;
                self.core.fill_array(addr, restored);
                line = restored;
            }
        }

        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            // Only a non-allocating store reaches here without an entry.
            return self.untracked_store(process, has_maf, addr, line);
        };
        if req != MessageKind::NonAllocatingStoreReq {
            entry.set_protected(true);
        }
        let sharers = entry.sharers.clone();

        if req == MessageKind::UpgradeReq && !sharers.is_sharer(requester) {
            debug!(bank = self.core.bank, addr = %addr, requester, "upgrade from non-sharer becomes write");
            req = MessageKind::WriteReq;
            process.transport.message.kind = MessageKind::WriteReq;
        }

        if sharers.no_sharers() && !line.is_valid() {
            if maf_waiting {
                return self.core.stall(process, has_maf, MafState::WaitingForRequest);
            }
            self.forward_to_memory(process, has_maf);
            if req == MessageKind::WriteReq {
                let mut notify = MemoryMessage::new(MessageKind::MissNotify, addr);
                notify.outstanding = 1;
                process.set_reply(process.transport.derive(notify, DestinationKind::Requester));
                process.action = Action::NotifyAndWaitAck;
            } else if req != MessageKind::NonAllocatingStoreReq {
                self.core.park_cache_eb(process);
            }
            return;
        }

        match req {
            MessageKind::ReadReq | MessageKind::FetchReq => {
                self.read_on_chip(process, has_maf, addr, line, &sharers, maf_waiting);
            }
            MessageKind::WriteReq => self.write_on_chip(process, has_maf, addr, line, &sharers),
            MessageKind::UpgradeReq => self.upgrade(process, has_maf, addr, line, &sharers),
            MessageKind::NonAllocatingStoreReq => {
                if line.is_valid() {
                    self.store_in_array(process, has_maf, addr);
                } else {
                    self.forward_to_memory(process, has_maf);
                }
            }
            other => panic!(
                "bank {}: unexpected request kind {other} for {addr}",
                self.core.bank
            ),
        }
    }

    /// Non-allocating store to a block the directory does not track.
    fn untracked_store(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        addr: PhysAddr,
        line: LineState,
    ) {
        if line.is_valid() {
            self.core.array.set_state(addr, LineState::Modified);
            self.store_in_array(process, has_maf, addr);
        } else {
            self.forward_to_memory(process, has_maf);
        }
    }

    fn store_in_array(&mut self, process: &mut ProcessEntry, has_maf: bool, addr: PhysAddr) {
        self.core.array.record_access(addr);
        let reply = MemoryMessage::new(MessageKind::NonAllocatingStoreReply, addr)
            .with_size(process.transport.message.req_size)
            .with_ack(true, false);
        let mut reply = process.transport.derive(reply, DestinationKind::Requester);
        reply.set_fill_level(FillLevel::Array);
        process.set_reply(reply);
        process.requires_data = true;
        let empty = self.core.empty_sharers();
        let _ = self.core.park(process, has_maf, MafState::WaitingForAck, empty);
        process.action = Action::Reply;
    }

    /// Sends the request itself to memory and waits for the requester's ack.
    fn forward_to_memory(&mut self, process: &mut ProcessEntry, has_maf: bool) {
        process.transport.dest_mut().kind = DestinationKind::Memory;
        process.add_snoop(process.transport.clone());
        let empty = self.core.empty_sharers();
        let _ = self.core.park(process, has_maf, MafState::WaitingForAck, empty);
        process.action = Action::FwdAndWaitAck;
    }

    fn read_on_chip(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        addr: PhysAddr,
        line: LineState,
        sharers: &SharerSet,
        maf_waiting: bool,
    ) {
        let fetch = process.transport.kind() == MessageKind::FetchReq;
        let requester = self.core.requester(process);

        // A lone sharer of an exclusive line may hold it modified.
        if !line.is_valid() || (sharers.one_sharer() && line == LineState::Exclusive) {
            if sharers.one_sharer() && maf_waiting {
                return self.core.stall(process, has_maf, MafState::WaitingForRequest);
            }
            let kind = if fetch {
                MessageKind::FetchFwd
            } else {
                MessageKind::ReadFwd
            };
            let fwd = MemoryMessage::new(kind, addr)
                .with_size(process.transport.message.req_size)
                .with_ack(true, !line.is_valid());
            let mut fwd = process.transport.derive(fwd, DestinationKind::Source);
            let sharer = self.core.pick_sharer(sharers, fwd.dest().directory);
            fwd.dest_mut().source = Some(sharer);
            process.transport.dest_mut().source = Some(sharer);
            process.add_snoop(fwd);
            process.action = Action::FwdAndWaitAck;
            let _ = self.core.park(process, has_maf, MafState::WaitingForAck, sharers.clone());
            self.core.park_cache_eb(process);
            debug!(bank = self.core.bank, addr = %addr, sharer, fetch, "read forwarded to sharer");
            return;
        }

        let mut kind = MessageKind::MissReply;
        if sharers.no_sharers() && line != LineState::Shared && !fetch {
            // An earlier reader is about to become exclusive; serve this one after it.
            if maf_waiting {
                return self.core.stall(process, has_maf, MafState::WaitingForRequest);
            }
            kind = MessageKind::MissReplyWritable;
            if line == LineState::Modified {
                kind = MessageKind::MissReplyDirty;
                self.core.array.invalidate(addr);
            }
        }
        if fetch {
            kind = MessageKind::FetchReply;
        }

        let block_size = self.core.block_size_u32();
        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            panic!("bank {}: directory entry for {addr} vanished", self.core.bank);
        };
        entry.sharers.add_sharer(requester);
        let block_state = entry.sharers.clone();

        let reply = MemoryMessage::new(kind, addr)
            .with_size(block_size)
            .with_ack(true, false);
        let mut reply = process.transport.derive(reply, DestinationKind::Requester);
        reply.set_fill_level(FillLevel::Array);
        process.set_reply(reply);
        process.requires_data = true;
        self.core.array.record_access(addr);
        let _ = self.core.park(process, has_maf, MafState::WaitingForAck, block_state);
        process.action = Action::Reply;
    }

    fn write_on_chip(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        addr: PhysAddr,
        line: LineState,
        sharers: &SharerSet,
    ) {
        let requester = self.core.requester(process);
        let block_size = self.core.block_size_u32();

        if sharers.no_sharers() {
            let kind = if line == LineState::Modified {
                MessageKind::MissReplyDirty
            } else {
                MessageKind::MissReplyWritable
            };
            let Some(entry) = self.core.directory.lookup_mut(addr) else {
                panic!("bank {}: directory entry for {addr} vanished", self.core.bank);
            };
            entry.sharers.add_sharer(requester);
            let block_state = entry.sharers.clone();
            if line.is_valid() {
                self.core.array.invalidate(addr);
            }

            let mut reply = MemoryMessage::new(kind, addr)
                .with_size(block_size)
                .with_ack(true, false);
            reply.outstanding = -1;
            let mut reply = process.transport.derive(reply, DestinationKind::Requester);
            reply.set_fill_level(FillLevel::Array);
            process.set_reply(reply);
            process.requires_data = true;
            self.core.array.record_access(addr);
            process.action = Action::Reply;
            let _ = self.core.park(process, has_maf, MafState::WaitingForAck, block_state);
            return;
        }

        let mut needs_invalidates = true;
        let mut notify_has_data = true;
        let mut sharer = None;

        if !line.is_valid() || (line == LineState::Exclusive && sharers.one_sharer()) {
            let source = self
                .core
                .pick_sharer(sharers, process.transport.dest().directory);
            let fwd = MemoryMessage::new(MessageKind::WriteFwd, addr)
                .with_size(process.transport.message.req_size);
            let mut fwd = process.transport.derive(fwd, DestinationKind::Source);
            fwd.dest_mut().source = Some(source);
            process.add_snoop(fwd);
            sharer = Some(source);
            needs_invalidates = !sharers.one_sharer();
            notify_has_data = false;
        }

        if needs_invalidates {
            let targets = sharers.other_sharers(sharer);
            assert!(
                !targets.is_empty(),
                "bank {}: write to {addr} needs invalidates but has no targets",
                self.core.bank
            );
            let mut inv = process.transport.derive(
                MemoryMessage::new(MessageKind::Invalidate, addr),
                DestinationKind::Multicast,
            );
            inv.dest_mut().multicast = targets;
            process.add_snoop(inv);
        }

        let mut notify = MemoryMessage::new(MessageKind::MissNotify, addr).with_ack(true, false);
        notify.outstanding = i32::try_from(sharers.count()).unwrap_or(i32::MAX);
        if notify_has_data {
            notify.kind = MessageKind::MissNotifyData;
            notify.req_size = block_size;
            process.requires_data = true;
            self.core.array.record_access(addr);
        }
        let mut notify = process.transport.derive(notify, DestinationKind::Requester);
        if notify_has_data {
            notify.set_fill_level(FillLevel::Array);
        }
        process.set_reply(notify);
        process.action = Action::NotifyAndWaitAck;
        process.transport.dest_mut().source = sharer;

        if line.is_valid() {
            self.core.array.invalidate(addr);
        }
        let empty = self.core.empty_sharers();
        let _ = self.core.park(process, has_maf, MafState::WaitingForAck, empty);
    }

    fn upgrade(
        &mut self,
        process: &mut ProcessEntry,
        has_maf: bool,
        addr: PhysAddr,
        line: LineState,
        sharers: &SharerSet,
    ) {
        let requester = self.core.requester(process);
        if line.is_valid() {
            self.core.array.invalidate(addr);
        }

        if sharers.count() <= 1 {
            assert_eq!(
                sharers.first_sharer(),
                Some(requester),
                "bank {}: upgrade of {addr} by core {requester} that is not the sole sharer",
                self.core.bank
            );
            let mut reply = MemoryMessage::new(MessageKind::UpgradeReply, addr).with_ack(true, false);
            reply.outstanding = -1;
            let mut reply = process.transport.derive(reply, DestinationKind::Requester);
            reply.set_fill_level(FillLevel::Directory);
            process.set_reply(reply);
            let empty = self.core.empty_sharers();
            let _ = self.core.park(process, has_maf, MafState::WaitingForAck, empty);
            process.action = Action::Reply;
            return;
        }

        let mut inv = process.transport.derive(
            MemoryMessage::new(MessageKind::Invalidate, addr),
            DestinationKind::Multicast,
        );
        inv.dest_mut().multicast = sharers.other_sharers(Some(requester));
        process.add_snoop(inv);

        let mut notify = MemoryMessage::new(MessageKind::MissNotify, addr).with_ack(true, false);
        notify.outstanding = i32::try_from(sharers.count() - 1).unwrap_or(i32::MAX);
        process.set_reply(process.transport.derive(notify, DestinationKind::Requester));
        process.action = Action::NotifyAndWaitAck;
        process.transport.dest_mut().source = Some(requester);

        let empty = self.core.empty_sharers();
        let _ = self.core.park(process, has_maf, MafState::WaitingForAck, empty);
    }

    fn do_evict(&mut self, process: &mut ProcessEntry, has_maf: bool) {
        let addr = self.core.block_addr(process.addr());
        let kind = process.transport.kind();
        let source = self.core.requester(process);
        assert!(
            kind.is_evict(),
            "bank {}: evict path entered with {kind} for {addr}",
            self.core.bank
        );
        process.action = Action::NoAction;

        if self
            .core
            .maf
            .find_for_requester(addr, MafState::WaitingForAck, Some(source))
            .is_some()
        {
            debug!(bank = self.core.bank, addr = %addr, source, "evict waits for the evicting core's ack");
            return self.core.stall(process, has_maf, MafState::WaitingForRequest);
        }
        if has_maf {
            // A woken evict retires its own entry now; it never waits again.
            let _ = self.core.maf.remove(process.maf_id());
            process.maf = None;
        }

        let active_write = self
            .core
            .maf
            .find_first(addr, MafState::WaitingForAck)
            .is_some_and(|id| {
                matches!(
                    self.core.maf.entry(id).transport.kind(),
                    MessageKind::WriteReq | MessageKind::UpgradeReq
                )
            });

        let mut requires_fwd = false;
        if process.transport.message.ack_required {
            let ack = process.transport.derive(
                MemoryMessage::new(MessageKind::EvictAck, addr),
                DestinationKind::Requester,
            );
            process.add_snoop(ack);
            requires_fwd = true;
        }

        let in_directory = self
            .core
            .directory
            .lookup(addr)
            .map(|e| e.sharers.is_sharer(source));
        let in_buffer = self
            .core
            .directory
            .evict_buffer()
            .find(addr)
            .map(|e| e.state.is_sharer(source));
        let valid_sharer = in_directory.or(in_buffer).unwrap_or(false);

        // Data racing with an invalidation is stale and ignored.
        let carries_data = kind == MessageKind::EvictDirty
            || (kind == MessageKind::EvictWritable && process.transport.message.evict_has_data);
        if carries_data && valid_sharer {
            let line = self.core.array.state(addr);
            if line.is_valid() {
                self.core.array.record_access(addr);
                self.core.array.set_state(addr, LineState::Modified);
            } else {
                self.core.recover_dir_eb_reservation(process, addr);
                if process.reservations.cache_eb > 0 || self.core.cache_eb.has_space(1) {
                    if self.core.cache_eb.find(addr).is_some_and(|e| !e.pending) {
                        let _ = self.core.cache_eb.remove(addr);
                    }
                    let state = if kind == MessageKind::EvictDirty {
                        LineState::Modified
                    } else {
                        LineState::Exclusive
                    };
                    self.core.fill_array(addr, state);
                } else if kind == MessageKind::EvictDirty {
                    warn!(bank = self.core.bank, addr = %addr, "cache EB full, dirty evict sent to memory");
                    process.transport.dest_mut().kind = DestinationKind::Memory;
                    process.add_snoop(process.transport.clone());
                    requires_fwd = true;
                }
            }
        }

        if let Some(entry) = self.core.directory.evict_buffer_mut().find_mut(addr) {
            assert!(
                !active_write,
                "bank {}: write active on {addr} while it sits in the directory EB",
                self.core.bank
            );
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
            process.action = match (wake, requires_fwd) {
                (true, true) => Action::FwdAndWakeEvictMaf,
                (true, false) => Action::WakeEvictMaf,
                (false, true) => Action::Forward,
                (false, false) => Action::NoAction,
            };
            return;
        }

        // The entry may already be gone if a back-invalidation ack overtook this evict.
        if let Some(entry) = self.core.directory.lookup_mut(addr) {
            entry.sharers.remove_sharer(source);
        }
        process.action = if requires_fwd {
            Action::Forward
        } else {
            Action::NoAction
        };
    }

    /// The `WaitingForAck` entry opened for `requester` on `addr`.
    fn active_entry(&self, addr: PhysAddr, requester: usize, reply: MessageKind) -> MafId {
        match self
            .core
            .maf
            .find_for_requester(addr, MafState::WaitingForAck, Some(requester))
        {
            Some(id) => id,
            None => panic!(
                "bank {}: {reply} for {addr} from core {requester} matches no active MAF entry",
                self.core.bank
            ),
        }
    }

    /// The only `WaitingForAck` entry on `addr`, which must be a `expected` request.
    fn exclusive_entry(&self, addr: PhysAddr, expected: MessageKind, reply: MessageKind) -> MafId {
        let Some(id) = self.core.maf.find_first(addr, MafState::WaitingForAck) else {
            panic!("bank {}: {reply} for {addr} with no active MAF entry", self.core.bank);
        };
        let active = self.core.maf.entry(id).transport.kind();
        assert_eq!(
            active, expected,
            "bank {}: {reply} for {addr} answers a {active}",
            self.core.bank
        );
        id
    }

    /// Allocates `addr` in the array for data arriving with a reply.
    fn allocate_for_data(&mut self, addr: PhysAddr, reply: MessageKind) {
        if self.core.array.state(addr).is_valid() {
            return;
        }
        assert!(
            self.core.cache_eb.find(addr).is_none(),
            "bank {}: {reply} brings data for {addr} that still sits in the cache EB",
            self.core.bank
        );
        if let Some(victim) = self.core.array.allocate(addr) {
            let _ = self.core.evict_cache_block(victim);
        }
    }

    fn handle_invalidate_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        process.action = Action::NoAction;
        if process.transport.kind() == MessageKind::InvUpdateAck {
            // Keep the dirty data on chip instead of writing it back.
            self.core.recover_dir_eb_reservation(process, addr);
            self.allocate_for_data(addr, MessageKind::InvUpdateAck);
            self.core.array.set_state(addr, LineState::Modified);
            process.requires_data = true;
        }
        let sharer = process.transport.dest().other;
        let _ = self.core.complete_back_invalidate(process, addr, sharer);
    }

    fn handle_read_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr, requester: usize) {
        let kind = process.transport.kind();
        let id = self.active_entry(addr, requester, kind);
        process.maf = Some(id);
        self.core.recover_cache_eb(process, id);

        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            panic!("bank {}: {kind} for {addr} without a directory entry", self.core.bank);
        };
        entry.sharers.add_sharer(requester);
        process.action = Action::RemoveAndWakeMaf;

        if process.transport.message.ack_requires_data {
            self.allocate_for_data(addr, kind);
            process.requires_data = true;
            let line = self.core.array.state(addr);
            let state = match kind {
                MessageKind::ReadAckDirty | MessageKind::FetchAckDirty => LineState::Modified,
                _ if line == LineState::Modified => LineState::Modified,
                MessageKind::FetchAck => LineState::Shared,
                _ => LineState::Exclusive,
            };
            self.core.array.set_state(addr, state);
        }
    }

    fn handle_write_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr, requester: usize) {
        let kind = process.transport.kind();
        let expected = if kind == MessageKind::WriteAck {
            MessageKind::WriteReq
        } else {
            MessageKind::UpgradeReq
        };
        let id = self.exclusive_entry(addr, expected, kind);

        let Some(entry) = self.core.directory.lookup_mut(addr) else {
            panic!("bank {}: {kind} for untracked block {addr}", self.core.bank);
        };
        entry.sharers.set_sharer(requester);
        entry.set_protected(false);

        if self.core.array.state(addr).is_valid() {
            self.core.array.set_state(addr, LineState::Exclusive);
        } else if let Some(buffered) = self.core.cache_eb.find_mut(addr) {
            if self.core.evict_clean {
                buffered.state = LineState::Exclusive;
                buffered.kind = MessageKind::EvictClean;
            } else if !buffered.pending {
                trace!(bank = self.core.bank, addr = %addr, "stale cache EB line dropped");
                let _ = self.core.cache_eb.remove(addr);
            }
        }

        process.maf = Some(id);
        self.core.recover_cache_eb(process, id);
        process.action = Action::RemoveAndWakeMaf;
    }

    fn handle_memory_reply(&mut self, process: &mut ProcessEntry, addr: PhysAddr, requester: usize) {
        let kind = process.transport.kind();
        let id = self.active_entry(addr, requester, kind);
        process.maf = Some(id);
        self.core.recover_cache_eb(process, id);

        let reply = process
            .transport
            .derive(process.transport.message.clone(), DestinationKind::Requester);
        process.set_reply(reply);
        process.action = Action::Reply;

        let original = self.core.maf.entry(id).transport.kind();
        if matches!(original, MessageKind::ReadReq | MessageKind::FetchReq) {
            self.allocate_for_data(addr, kind);
            process.requires_data = true;
            process.transmit_after_tag = true;
            let state = if original != MessageKind::FetchReq && kind == MessageKind::MissReplyWritable {
                LineState::Exclusive
            } else {
                LineState::Shared
            };
            self.core.array.set_state(addr, state);
        }
    }

    fn handle_fwd_nack(&mut self, process: &mut ProcessEntry, addr: PhysAddr, requester: usize) {
        let Some(sharers) = self.core.directory.lookup(addr).map(|e| e.sharers.clone()) else {
            panic!("bank {}: FwdNAck for untracked block {addr}", self.core.bank);
        };
        let id = self.active_entry(addr, requester, MessageKind::FwdNAck);
        process.maf = Some(id);

        // Another sharer may have written a dirty copy back into the array meanwhile.
        let mut line = self.core.array.state(addr);
        if !line.is_valid() {
            if let Some(buffered) = self.core.cache_eb.find(addr).filter(|e| !e.pending) {
                let restored = buffered.state;
                let _ = self.core.cache_eb.remove(addr);
                self.core.fill_array(addr, restored);
                line = restored;
            }
        }

        if line.is_valid() {
            let kind = if sharers.no_sharers() && line != LineState::Shared {
                MessageKind::MissReplyWritable
            } else {
                MessageKind::MissReply
            };
            let reply = MemoryMessage::new(kind, addr)
                .with_size(self.core.block_size_u32())
                .with_ack(true, false);
            let mut reply = process.transport.derive(reply, DestinationKind::Requester);
            reply.set_fill_level(FillLevel::Array);
            process.set_reply(reply);
            process.requires_data = true;
            self.core.array.record_access(addr);
            self.core.maf.set_state(id, MafState::WaitingForAck);
            process.action = Action::Reply;
        } else if sharers.no_sharers() {
            let entry = self.core.maf.entry_mut(id);
            let dest = entry.transport.dest_mut();
            dest.kind = DestinationKind::Memory;
            dest.source = None;
            let retry = entry.transport.clone();
            process.add_snoop(retry);
            process.action = Action::Forward;
        } else {
            let active = &self.core.maf.entry(id).transport;
            let kind = if active.kind() == MessageKind::FetchReq {
                MessageKind::FetchFwd
            } else {
                MessageKind::ReadFwd
            };
            let msg = MemoryMessage::new(kind, active.addr())
                .with_size(active.message.req_size)
                .with_ack(true, true);
            let mut fwd = active.derive(msg, DestinationKind::Source);
            let sharer = self.core.pick_sharer(&sharers, fwd.dest().directory);
            fwd.dest_mut().source = Some(sharer);
            process.add_snoop(fwd);
            process.action = Action::Forward;
        }
    }

    fn handle_evict_ack(&mut self, process: &mut ProcessEntry, addr: PhysAddr) {
        let pending = self.core.cache_eb.find(addr).map(|e| e.pending);
        assert_eq!(
            pending,
            Some(true),
            "bank {}: EvictAck for {addr} without a pending write-back",
            self.core.bank
        );
        let _ = self.core.cache_eb.remove(addr);
        match self.core.maf.find_first(addr, MafState::WaitingForEvict) {
            Some(id) => {
                process.maf = Some(id);
                process.action = Action::WakeEvictMaf;
            }
            None => process.action = Action::NoAction,
        }
    }
}

impl Policy for NonInclusiveMesi {
    fn name(&self) -> &'static str {
        "NonInclusiveMESI"
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
            MessageKind::InvalidateAck | MessageKind::InvUpdateAck => {
                self.handle_invalidate_ack(process, addr);
            }
            MessageKind::ReadAck
            | MessageKind::ReadAckDirty
            | MessageKind::FetchAck
            | MessageKind::FetchAckDirty => {
                let requester = self.core.requester(process);
                self.handle_read_ack(process, addr, requester);
            }
            MessageKind::NasAck => {
                let id = self.exclusive_entry(addr, MessageKind::NonAllocatingStoreReq, kind);
                process.maf = Some(id);
                self.core.recover_cache_eb(process, id);
                process.action = Action::RemoveAndWakeMaf;
            }
            MessageKind::WriteAck | MessageKind::UpgradeAck => {
                let requester = self.core.requester(process);
                self.handle_write_ack(process, addr, requester);
            }
            MessageKind::NonAllocatingStoreReply => {
                let requester = self.core.requester(process);
                process.maf = Some(self.active_entry(addr, requester, kind));
                let mut msg = process.transport.message.clone();
                msg.ack_required = false;
                let reply = process.transport.derive(msg, DestinationKind::Requester);
                process.set_reply(reply);
                process.action = Action::ReplyAndRemoveMaf;
            }
            MessageKind::FetchReply | MessageKind::MissReply | MessageKind::MissReplyWritable => {
                let requester = self.core.requester(process);
                self.handle_memory_reply(process, addr, requester);
            }
            MessageKind::FwdNAck => {
                let requester = self.core.requester(process);
                self.handle_fwd_nack(process, addr, requester);
            }
            MessageKind::EvictAck => self.handle_evict_ack(process, addr),
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
        process.add_snoop(process.transport.clone());
        process.action = Action::Forward;
        // The cache EB slot now lives on the directory EB entry.
        process.reservations.cache_eb = 0;
    }

    fn handle_idle_work(&mut self, process: &mut ProcessEntry) {
        if process.transport.kind() != MessageKind::Idle {
            return self.handle_dir_evict(process);
        }

        let pressure = self.core.array.eviction_pressure();
        let dir_ready = self.core.directory.idle_work_ready();
        process.lookups = 1;
        process.action = Action::NoAction;

        // Under pressure, back-invalidation and preemptive eviction take turns.
        let dir_turn = dir_ready && (self.dir_idle_turn || !pressure);
        if dir_ready && pressure {
            self.dir_idle_turn = !self.dir_idle_turn;
        }
        if dir_turn {
            // The back-invalidate is admitted as a directory evict.
            return;
        }

        if pressure {
            if let Some(victim) = self.core.array.preemptive_eviction() {
                process.requires_data = self.core.evict_cache_block(victim);
            }
        } else if self.core.cache_eb.evictable_ready() {
            process.transport = self.core.cache_evict_transport();
            self.handle_cache_evict(process);
        } else if !self.core.cache_eb.is_empty() {
            trace!(bank = self.core.bank, "evictable line taken before idle work ran");
        }
    }
}
