//! Protocol decision tables.
//!
//! A table protocol describes its behaviour as data: for every combination of sharing
//! state and incoming message kind it names the snoop to send, the acks that close the
//! snoop, and the response to give the requester. This module provides:
//! 1. **Sharing State:** The coarse classification of a block's sharers.
//! 2. **Primary Action:** One row of a table.
//! 3. **Tables:** Lookup with poison detection, and the `SingleCMPRegion` rows.

use std::collections::HashMap;
use std::fmt;

use crate::protocol::MessageKind;
use crate::state::SharerSet;

/// Coarse sharing state of a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SharingState {
    /// No core holds the block.
    ZeroSharers,
    /// One core holds a read-only copy.
    OneSharer,
    /// One core holds the block writable.
    ExclSharer,
    /// Several cores hold read-only copies.
    ManySharers,
}

impl SharingState {
    /// Every state, in declaration order.
    pub const ALL: [Self; 4] = [
        Self::ZeroSharers,
        Self::OneSharer,
        Self::ExclSharer,
        Self::ManySharers,
    ];

    /// Classifies `sharers`; `exclusive` marks a lone sharer that may write.
    pub fn classify(sharers: &SharerSet, exclusive: bool) -> Self {
        match sharers.count() {
            0 => Self::ZeroSharers,
            1 if exclusive => Self::ExclSharer,
            1 => Self::OneSharer,
            _ => Self::ManySharers,
        }
    }
}

impl fmt::Display for SharingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One decision-table row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PrimaryAction {
    /// Snoop sent to sharers, if any.
    pub snoop: Option<MessageKind>,
    /// Acks that close the snoop: clean and data-carrying.
    pub terminal: [Option<MessageKind>; 2],
    /// Response given to the requester.
    pub response: Option<MessageKind>,
    /// Memory must be involved when no sharer supplies data, or the message itself goes on
    /// to memory for evictions.
    pub forward: bool,
    /// Snoop every other sharer at once instead of one at a time.
    pub multicast: bool,
    /// Data from the snoop satisfies the request.
    pub reply_from_snoop: bool,
    /// The combination must never occur.
    pub poison: bool,
}

impl PrimaryAction {
    /// True if `kind` closes this action's snoop.
    pub fn is_terminal(&self, kind: MessageKind) -> bool {
        self.terminal.contains(&Some(kind))
    }
}

/// Decision table keyed by sharing state and message kind.
#[derive(Clone, Debug, Default)]
pub struct ProtocolTable {
    rows: HashMap<(SharingState, MessageKind), PrimaryAction>,
}

impl ProtocolTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces the row for `(state, kind)`.
    pub fn insert(&mut self, state: SharingState, kind: MessageKind, action: PrimaryAction) {
        let _ = self.rows.insert((state, kind), action);
    }

    /// Row for `(state, kind)`, including poison rows.
    pub fn get(&self, state: SharingState, kind: MessageKind) -> Option<&PrimaryAction> {
        self.rows.get(&(state, kind))
    }

    /// Row for `(state, kind)`.
    ///
    /// # Panics
    ///
    /// Panics if the row is missing or poisoned: the protocol reached a combination it
    /// does not define.
    pub fn lookup(&self, state: SharingState, kind: MessageKind) -> &PrimaryAction {
        match self.rows.get(&(state, kind)) {
            Some(action) if !action.poison => action,
            Some(_) => panic!("poison protocol action: {kind} in state {state}"),
            None => panic!("no protocol action for {kind} in state {state}"),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True if the table has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows of the single-chip region protocol.
    ///
    /// Reads and fetches pull data from one sharer and fall back to memory. Writes and
    /// upgrades invalidate the other sharers. With `propagate_clean_evicts`, clean and
    /// writable evictions continue to memory like dirty ones.
    pub fn single_cmp_region(propagate_clean_evicts: bool) -> Self {
        use MessageKind::{
            EvictClean, EvictDirty, EvictWritable, FetchReq, InvUpdateAck, Invalidate,
            InvalidateAck, MissReply, MissReplyWritable, ReadReq, ReturnReply, ReturnReq,
            UpgradeReply, UpgradeReq, WriteReq,
        };
        use SharingState::{ExclSharer, ManySharers, OneSharer, ZeroSharers};

        let mut table = Self::new();
        let mut add = |kind: MessageKind,
                       state: SharingState,
                       snoop: Option<MessageKind>,
                       terminal: [Option<MessageKind>; 2],
                       response: Option<MessageKind>,
                       flags: [bool; 4]| {
            let [forward, multicast, reply_from_snoop, poison] = flags;
            table.insert(
                state,
                kind,
                PrimaryAction {
                    snoop,
                    terminal,
                    response,
                    forward,
                    multicast,
                    reply_from_snoop,
                    poison,
                },
            );
        };

        let returned = [Some(ReturnReply), Some(ReturnReply)];
        let invalidated = [Some(InvalidateAck), Some(InvUpdateAck)];
        let none = [None, None];

        //  kind        state        snoop             terminal     response                 fwd    multi  rfs    poison
        add(ReadReq, ZeroSharers, None, none, Some(MissReplyWritable), [true, false, false, false]);
        add(ReadReq, OneSharer, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);
        add(ReadReq, ExclSharer, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);
        add(ReadReq, ManySharers, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);

        add(FetchReq, ZeroSharers, None, none, Some(MissReply), [true, false, false, false]);
        add(FetchReq, OneSharer, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);
        add(FetchReq, ExclSharer, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);
        add(FetchReq, ManySharers, Some(ReturnReq), returned, Some(MissReply), [true, false, true, false]);

        add(UpgradeReq, ZeroSharers, None, none, Some(UpgradeReply), [false, false, false, true]);
        add(UpgradeReq, OneSharer, None, none, Some(UpgradeReply), [false, false, false, false]);
        add(UpgradeReq, ExclSharer, None, none, Some(UpgradeReply), [false, false, false, false]);
        add(UpgradeReq, ManySharers, Some(Invalidate), invalidated, Some(UpgradeReply), [false, true, false, false]);

        add(WriteReq, ZeroSharers, None, none, Some(MissReplyWritable), [true, false, false, false]);
        add(WriteReq, OneSharer, Some(Invalidate), invalidated, Some(MissReplyWritable), [true, false, true, false]);
        add(WriteReq, ExclSharer, Some(Invalidate), invalidated, Some(MissReplyWritable), [true, false, true, false]);
        add(WriteReq, ManySharers, Some(Invalidate), invalidated, Some(MissReplyWritable), [true, true, false, false]);

        for kind in [EvictClean, EvictWritable] {
            add(kind, ZeroSharers, None, none, None, [false, false, false, true]);
            for state in [OneSharer, ExclSharer, ManySharers] {
                add(kind, state, None, none, None, [propagate_clean_evicts, false, false, false]);
            }
        }

        add(EvictDirty, ZeroSharers, None, none, None, [false, false, false, true]);
        for state in [OneSharer, ExclSharer, ManySharers] {
            add(EvictDirty, state, None, none, None, [true, false, false, false]);
        }

        table
    }
}
