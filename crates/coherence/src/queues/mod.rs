//! Queues and timed pipelines.
//!
//! 1. **Message Queues:** Bounded, reservable FIFOs used for every port.
//! 2. **Pipelines:** Multi-server latency models for the MAF, tag, and data stages.

/// Bounded message queue with reservations.
pub mod message_queue;

/// Timed multi-server pipeline.
pub mod pipeline;

pub use message_queue::MessageQueue;
pub use pipeline::{PipelineFifo, PipelineTiming};
