//! Coherence message types.
//!
//! This module defines everything that travels between cores, banks, and memory:
//! 1. **Messages:** The `MessageKind` vocabulary and the `MemoryMessage` payload.
//! 2. **Routing:** `Destination` descriptors, including multicast peeling.
//! 3. **Transports:** The owned bundle handed from queue to pipeline to queue.

/// Routing descriptors.
pub mod destination;

/// Message kinds and payloads.
pub mod message;

/// Transport bundle and transaction tracker.
pub mod transport;

pub use destination::{Destination, DestinationKind};
pub use message::{MemoryMessage, MessageKind};
pub use transport::{FillLevel, TransactionTracker, Transport};
