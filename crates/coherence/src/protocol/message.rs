//! Coherence message vocabulary.
//!
//! Every message that enters or leaves a bank carries a `MemoryMessage`. The kinds fall
//! into five groups:
//! 1. **Requests:** Reads, writes, fetches, upgrades, and non-allocating stores from cores.
//! 2. **Evictions:** Clean, writable, and dirty write-backs from cores or the local array.
//! 3. **Replies:** Data and permission grants sent back to a requester.
//! 4. **Snoops:** Forwards and invalidations sent to sharers.
//! 5. **Acknowledgements:** Terminal acks that close a transaction.

use std::fmt;

use crate::common::PhysAddr;

/// Kind of coherence message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MessageKind {
    /// Read for a shareable (possibly exclusive) copy.
    ReadReq,
    /// Read for an exclusive, writable copy.
    WriteReq,
    /// Instruction fetch; never granted exclusive.
    FetchReq,
    /// Request for write permission on a line the requester already shares.
    UpgradeReq,
    /// Store that must not allocate in the requester's cache.
    NonAllocatingStoreReq,

    /// Eviction of a clean, shared line.
    EvictClean,
    /// Eviction of a clean, exclusive line.
    EvictWritable,
    /// Eviction of a modified line; carries data.
    EvictDirty,

    /// Shared data reply.
    MissReply,
    /// Exclusive data reply.
    MissReplyWritable,
    /// Exclusive data reply with the dirty copy.
    MissReplyDirty,
    /// Data reply to an instruction fetch.
    FetchReply,
    /// Write permission grant without data.
    UpgradeReply,
    /// Completion of a non-allocating store.
    NonAllocatingStoreReply,
    /// Tells the requester how many acks to expect before the data is usable.
    MissNotify,
    /// As `MissNotify`, but the reply carries the data.
    MissNotifyData,
    /// Confirms a write-back was absorbed.
    EvictAck,

    /// Forwarded read to the core holding the line.
    ReadFwd,
    /// Forwarded fetch to the core holding the line.
    FetchFwd,
    /// Forwarded write to the core holding the line.
    WriteFwd,
    /// Invalidation of a shared copy.
    Invalidate,
    /// Invalidation issued when a directory entry is evicted.
    BackInvalidate,
    /// Request that the owner return the line to the directory.
    ReturnReq,

    /// Terminal ack of a read; no dirty data.
    ReadAck,
    /// Terminal ack of a read carrying dirty data.
    ReadAckDirty,
    /// Terminal ack of a fetch.
    FetchAck,
    /// Terminal ack of a fetch carrying dirty data.
    FetchAckDirty,
    /// Terminal ack of a write.
    WriteAck,
    /// Terminal ack of an upgrade.
    UpgradeAck,
    /// Terminal ack of a non-allocating store.
    NasAck,
    /// Forward target no longer holds the line.
    FwdNAck,
    /// Invalidation completed, no data.
    InvalidateAck,
    /// Invalidation completed with dirty data.
    InvUpdateAck,
    /// Owner returned the line.
    ReturnReply,

    /// Placeholder carried by idle-work records that have no concrete message.
    Idle,
}

impl MessageKind {
    /// True for the three eviction kinds.
    #[inline]
    pub const fn is_evict(self) -> bool {
        matches!(self, Self::EvictClean | Self::EvictWritable | Self::EvictDirty)
    }

    /// True for core-originated requests.
    #[inline]
    pub const fn is_request(self) -> bool {
        matches!(
            self,
            Self::ReadReq
                | Self::WriteReq
                | Self::FetchReq
                | Self::UpgradeReq
                | Self::NonAllocatingStoreReq
        )
    }

    /// True for requests that need exclusive ownership.
    #[inline]
    pub const fn is_write_like(self) -> bool {
        matches!(
            self,
            Self::WriteReq | Self::UpgradeReq | Self::NonAllocatingStoreReq
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The memory-operation part of a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryMessage {
    /// Message kind.
    pub kind: MessageKind,
    /// Target address; may be unaligned for incoming requests.
    pub addr: PhysAddr,
    /// Bytes requested or carried.
    pub req_size: u32,
    /// Receiver must send a terminal ack.
    pub ack_required: bool,
    /// The terminal ack must carry data back to this bank.
    pub ack_requires_data: bool,
    /// Eviction carries data.
    pub evict_has_data: bool,
    /// Acks the requester must collect; `-1` marks a final reply.
    pub outstanding: i32,
}

impl MemoryMessage {
    /// Creates a message with all flags cleared.
    pub const fn new(kind: MessageKind, addr: PhysAddr) -> Self {
        Self {
            kind,
            addr,
            req_size: 0,
            ack_required: false,
            ack_requires_data: false,
            evict_has_data: false,
            outstanding: 0,
        }
    }

    /// Builder helper setting `req_size`.
    #[must_use]
    pub const fn with_size(mut self, size: u32) -> Self {
        self.req_size = size;
        self
    }

    /// Builder helper setting `ack_required` and `ack_requires_data`.
    #[must_use]
    pub const fn with_ack(mut self, required: bool, requires_data: bool) -> Self {
        self.ack_required = required;
        self.ack_requires_data = requires_data;
        self
    }
}

impl fmt::Display for MemoryMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.kind, self.addr)?;
        if self.ack_required {
            f.write_str(" [ack]")?;
        }
        if self.ack_requires_data {
            f.write_str(" [ack-data]")?;
        }
        if self.evict_has_data {
            f.write_str(" [data]")?;
        }
        Ok(())
    }
}
