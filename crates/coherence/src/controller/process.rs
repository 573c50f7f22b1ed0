//! Work records.
//!
//! Every message or internal task admitted by a bank becomes a `ProcessEntry` that travels
//! through the MAF, tag, and data pipelines. This module provides:
//! 1. **Kinds and Actions:** What scheduled the record and what the policy decided.
//! 2. **Reservations:** The output-queue, MAF, and evict-buffer slots a record holds.
//! 3. **Admission:** `Reservations::acquire`, which claims a whole demand or nothing.
//!
//! A record owns its transport and the messages it will emit. It must hold no
//! reservations when it is finalized.

use std::fmt;

use crate::common::PhysAddr;
use crate::controller::directory_controller::OutputPorts;
use crate::maf::{MafId, MafReservation};
use crate::policy::Policy;
use crate::protocol::Transport;

/// What scheduled a work record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProcessKind {
    /// A MAF entry woken after its blocker completed.
    WakeMaf,
    /// Write-back of a cache evict-buffer line.
    CacheEvict,
    /// Back-invalidation of a directory evict-buffer entry.
    DirEvict,
    /// A message from the reply channel.
    Reply,
    /// A message from the snoop channel.
    Snoop,
    /// A message from the request channel.
    Request,
    /// Background maintenance.
    IdleWork,
}

impl ProcessKind {
    /// Every kind, in admission priority order.
    pub const ALL: [Self; 7] = [
        Self::WakeMaf,
        Self::CacheEvict,
        Self::DirEvict,
        Self::Reply,
        Self::Snoop,
        Self::Request,
        Self::IdleWork,
    ];

    /// Position in [`ProcessKind::ALL`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Decision taken by a policy handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum Action {
    /// Emit snoops and keep the MAF entry waiting for the terminal ack.
    FwdAndWaitAck,
    /// Emit snoops and a notify reply, then wait for the terminal ack.
    NotifyAndWaitAck,
    /// Emit snoops and retire the MAF entry.
    ForwardAndRemoveMaf,
    /// Emit snoops and wake the entry that waited on an eviction.
    FwdAndWakeEvictMaf,
    /// Wake the entry that waited on an eviction.
    WakeEvictMaf,
    /// Emit snoops.
    Forward,
    /// Pass the original request down the request channel.
    FwdRequest,
    /// Emit snoops and a reply.
    FwdAndReply,
    /// Emit a reply.
    Reply,
    /// Emit a reply and retire the MAF entry.
    ReplyAndRemoveMaf,
    /// Retire the MAF entry.
    RemoveMaf,
    /// Retire the MAF entry and wake its waiters.
    RemoveAndWakeMaf,
    /// The record was parked in the MAF.
    #[default]
    Stall,
    /// Nothing to emit.
    NoAction,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Self; 14] = [
        Self::FwdAndWaitAck,
        Self::NotifyAndWaitAck,
        Self::ForwardAndRemoveMaf,
        Self::FwdAndWakeEvictMaf,
        Self::WakeEvictMaf,
        Self::Forward,
        Self::FwdRequest,
        Self::FwdAndReply,
        Self::Reply,
        Self::ReplyAndRemoveMaf,
        Self::RemoveMaf,
        Self::RemoveAndWakeMaf,
        Self::Stall,
        Self::NoAction,
    ];

    /// Position in [`Action::ALL`].
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Resources a record asks for at admission.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Demand {
    /// Snoop-out slots.
    pub snoop_out: usize,
    /// Reply-out slots.
    pub reply_out: usize,
    /// Request-out slots.
    pub request_out: usize,
    /// One MAF slot.
    pub maf: bool,
    /// Slots in both evict buffers.
    pub eb: usize,
    /// Additional cache evict-buffer slots.
    pub cache_eb: usize,
}

/// Resources held by a record.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reservations {
    /// Snoop-out slots.
    pub snoop_out: usize,
    /// Reply-out slots.
    pub reply_out: usize,
    /// Request-out slots.
    pub request_out: usize,
    /// MAF token, taken by the policy when it inserts an entry.
    pub maf: Option<MafReservation>,
    /// Directory evict-buffer slots.
    pub dir_eb: usize,
    /// Cache evict-buffer slots. The policy may park these on a MAF or directory EB entry.
    pub cache_eb: usize,
}

impl Reservations {
    /// Claims every resource in `demand`, or nothing.
    ///
    /// Availability of each resource is checked before any of them is reserved, so a
    /// failed acquisition leaves every counter untouched and a successful one never
    /// yields a partial set.
    ///
    /// # Arguments
    ///
    /// * `demand` - Resources to claim.
    /// * `ports` - The bank's output queues.
    /// * `policy` - Owner of the MAF and evict buffers.
    ///
    /// # Returns
    ///
    /// The held reservations, or `None` if any resource is short.
    pub fn acquire(demand: Demand, ports: &mut OutputPorts, policy: &mut dyn Policy) -> Option<Self> {
        let available = ports.snoop.has_space(demand.snoop_out)
            && ports.reply.has_space(demand.reply_out)
            && ports.request.has_space(demand.request_out)
            && (!demand.maf || !policy.maf().is_full())
            && (demand.eb == 0 || policy.eb_has_space(demand.eb))
            && (demand.cache_eb == 0 || policy.cache_eb_has_space(demand.eb + demand.cache_eb));
        if !available {
            return None;
        }

        ports.snoop.reserve(demand.snoop_out);
        ports.reply.reserve(demand.reply_out);
        ports.request.reserve(demand.request_out);
        let maf = demand.maf.then(|| policy.maf_mut().reserve());
        if demand.eb > 0 {
            policy.reserve_eb(demand.eb);
        }
        if demand.cache_eb > 0 {
            policy.reserve_cache_eb(demand.cache_eb);
        }
        Some(Self {
            snoop_out: demand.snoop_out,
            reply_out: demand.reply_out,
            request_out: demand.request_out,
            maf,
            dir_eb: demand.eb,
            cache_eb: demand.eb + demand.cache_eb,
        })
    }

    /// True if nothing is held.
    pub const fn is_clear(&self) -> bool {
        self.snoop_out == 0
            && self.reply_out == 0
            && self.request_out == 0
            && self.maf.is_none()
            && self.dir_eb == 0
            && self.cache_eb == 0
    }
}

/// One unit of work in flight through a bank.
#[derive(Debug)]
pub struct ProcessEntry {
    /// What scheduled the record.
    pub kind: ProcessKind,
    /// Decision of the policy handler.
    pub action: Action,
    /// Tag-pipeline passes still required.
    pub lookups: u32,
    /// MAF entry the record acts on.
    pub maf: Option<MafId>,
    /// Message being processed.
    pub transport: Transport,
    /// Snoops to emit on the snoop channel.
    pub snoops: Vec<Transport>,
    /// Reply to emit on the reply channel.
    pub reply: Option<Transport>,
    /// Needs a data-array pass.
    pub requires_data: bool,
    /// Emit when the tag pass ends instead of after the data pass.
    pub transmit_after_tag: bool,
    /// Resources held.
    pub reservations: Reservations,
}

impl ProcessEntry {
    /// Creates a record holding `reservations`, needing one tag lookup.
    pub fn new(kind: ProcessKind, transport: Transport, reservations: Reservations) -> Self {
        Self {
            kind,
            action: Action::Stall,
            lookups: 1,
            maf: None,
            transport,
            snoops: Vec::new(),
            reply: None,
            requires_data: false,
            transmit_after_tag: false,
            reservations,
        }
    }

    /// Creates a record for a woken MAF entry.
    pub fn for_maf(id: MafId, transport: Transport, reservations: Reservations) -> Self {
        Self {
            maf: Some(id),
            ..Self::new(ProcessKind::WakeMaf, transport, reservations)
        }
    }

    /// Address of the message being processed.
    #[inline]
    pub fn addr(&self) -> PhysAddr {
        self.transport.addr()
    }

    /// Queues a snoop for emission.
    pub fn add_snoop(&mut self, snoop: Transport) {
        self.snoops.push(snoop);
    }

    /// Sets the reply to emit.
    pub fn set_reply(&mut self, reply: Transport) {
        self.reply = Some(reply);
    }

    /// MAF entry the record acts on.
    ///
    /// # Panics
    ///
    /// Panics if the policy did not link one.
    pub fn maf_id(&self) -> MafId {
        match self.maf {
            Some(id) => id,
            None => panic!(
                "{:?} record for {} with action {} has no MAF entry",
                self.kind, self.transport, self.action
            ),
        }
    }
}

impl fmt::Display for ProcessEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}[{}] {} (snoops {}, reply {})",
            self.kind,
            self.action,
            self.transport,
            self.snoops.len(),
            self.reply.is_some()
        )
    }
}
