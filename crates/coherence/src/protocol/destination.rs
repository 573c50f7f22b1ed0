//! Message routing descriptors.

use crate::common::NodeId;

/// Which field of a [`Destination`] names the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum DestinationKind {
    /// The core that issued the original request.
    #[default]
    Requester,
    /// The sharer chosen to service a forward.
    Source,
    /// The directory bank.
    Directory,
    /// Off-chip memory.
    Memory,
    /// Every node in the multicast list.
    Multicast,
    /// The node in the `other` field.
    Other,
}

/// Routing descriptor attached to a transport.
///
/// A destination remembers every party of the transaction so that replies can be
/// redirected by changing `kind` alone.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Destination {
    /// Receiver selector.
    pub kind: DestinationKind,
    /// Original requesting core.
    pub requester: Option<NodeId>,
    /// Sharer servicing a forward.
    pub source: Option<NodeId>,
    /// Directory bank handling the address.
    pub directory: Option<NodeId>,
    /// Auxiliary node, e.g. the target of one peeled multicast copy.
    pub other: Option<NodeId>,
    /// Receivers of a multicast, ascending.
    pub multicast: Vec<NodeId>,
}

impl Destination {
    /// Creates a destination of the given kind with no parties filled in.
    pub fn new(kind: DestinationKind) -> Self {
        Self {
            kind,
            ..Self::default()
        }
    }

    /// Creates a requester-addressed destination.
    pub fn requester(core: NodeId) -> Self {
        Self {
            requester: Some(core),
            ..Self::default()
        }
    }

    /// Copy of `self` retargeted to `kind`.
    #[must_use]
    pub fn retarget(&self, kind: DestinationKind) -> Self {
        Self {
            kind,
            multicast: Vec::new(),
            ..self.clone()
        }
    }

    /// Node this destination resolves to, for unicast kinds.
    pub fn target(&self) -> Option<NodeId> {
        match self.kind {
            DestinationKind::Requester => self.requester,
            DestinationKind::Source => self.source,
            DestinationKind::Directory => self.directory,
            DestinationKind::Other => self.other,
            DestinationKind::Memory | DestinationKind::Multicast => None,
        }
    }

    /// Peels the first receiver off a multicast list as a unicast copy.
    ///
    /// The returned copy has kind `Other` with `other` naming the receiver. Returns
    /// `None` when the list is empty.
    pub fn remove_first_multicast_dest(&mut self) -> Option<Self> {
        if self.multicast.is_empty() {
            return None;
        }
        let node = self.multicast.remove(0);
        let mut copy = self.retarget(DestinationKind::Other);
        copy.other = Some(node);
        Some(copy)
    }
}
