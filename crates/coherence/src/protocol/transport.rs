//! Message transport bundle.
//!
//! A transport carries the three slices that travel together through queues and
//! pipelines: the memory message, an optional routing descriptor, and an optional
//! latency-attribution tracker. Transports are moved, never shared; a work record owns
//! its transport until it hands it to an output queue.

use std::fmt;

use crate::common::{NodeId, PhysAddr};
use crate::protocol::destination::{Destination, DestinationKind};
use crate::protocol::message::{MemoryMessage, MessageKind};

/// Where a request was ultimately satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FillLevel {
    /// Served from the bank's own data array.
    Array,
    /// Served by the directory without data (permission only).
    Directory,
    /// Served by another on-chip cache.
    PeerCache,
    /// Served by off-chip memory.
    Memory,
}

/// Latency attribution annotation. Purely informational.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TransactionTracker {
    /// Bank that handled the transaction.
    pub bank: Option<NodeId>,
    /// Level that supplied the data.
    pub fill_level: Option<FillLevel>,
    /// Originating component label.
    pub source: Option<&'static str>,
}

/// Bundle of message, routing, and tracking slices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transport {
    /// The memory operation.
    pub message: MemoryMessage,
    /// Routing descriptor.
    pub destination: Option<Destination>,
    /// Latency attribution.
    pub tracker: Option<TransactionTracker>,
}

impl Transport {
    /// Creates a transport with a message and destination.
    pub fn new(message: MemoryMessage, destination: Destination) -> Self {
        Self {
            message,
            destination: Some(destination),
            tracker: None,
        }
    }

    /// Convenience constructor for a core-originated message.
    pub fn from_core(kind: MessageKind, addr: PhysAddr, core: NodeId) -> Self {
        Self::new(MemoryMessage::new(kind, addr), Destination::requester(core))
    }

    /// Transport for an idle-work record with nothing to do yet.
    pub(crate) fn idle() -> Self {
        Self {
            message: MemoryMessage::new(MessageKind::Idle, PhysAddr::default()),
            destination: None,
            tracker: None,
        }
    }

    /// Message kind.
    #[inline]
    pub const fn kind(&self) -> MessageKind {
        self.message.kind
    }

    /// Message address.
    #[inline]
    pub const fn addr(&self) -> PhysAddr {
        self.message.addr
    }

    /// Routing descriptor.
    ///
    /// # Panics
    ///
    /// Panics if the transport has none; every coherence message is routed.
    pub fn dest(&self) -> &Destination {
        match &self.destination {
            Some(d) => d,
            None => panic!("transport {} carries no destination", self.message),
        }
    }

    /// Mutable routing descriptor. Panics like [`Transport::dest`].
    pub fn dest_mut(&mut self) -> &mut Destination {
        match self.destination {
            Some(ref mut d) => d,
            None => panic!("transport {} carries no destination", self.message),
        }
    }

    /// Requesting core, if the transport names one.
    #[inline]
    pub fn requester(&self) -> Option<NodeId> {
        self.destination.as_ref().and_then(|d| d.requester)
    }

    /// Copy of this transport with a new message and a destination retargeted to `kind`.
    ///
    /// Used to derive replies and snoops that keep the original transaction's parties.
    pub fn derive(&self, message: MemoryMessage, kind: DestinationKind) -> Self {
        Self {
            message,
            destination: Some(self.dest().retarget(kind)),
            tracker: self.tracker.clone(),
        }
    }

    /// Records the fill level on the tracker, creating one if absent.
    pub fn set_fill_level(&mut self, level: FillLevel) {
        self.tracker.get_or_insert_with(TransactionTracker::default).fill_level = Some(level);
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(d) = &self.destination {
            write!(f, " -> {:?}", d.kind)?;
            if let Some(t) = d.target() {
                write!(f, "({t})")?;
            }
            if !d.multicast.is_empty() {
                write!(f, "{:?}", d.multicast)?;
            }
        }
        Ok(())
    }
}
