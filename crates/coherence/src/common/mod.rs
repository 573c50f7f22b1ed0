//! Common types used throughout the coherence engine.
//!
//! This module provides the building blocks shared by every component. It includes:
//! 1. **Address Types:** The `PhysAddr` newtype and block-alignment helpers.
//! 2. **Error Handling:** Recoverable configuration and checkpoint errors.
//! 3. **Node Identifiers:** The integer type used for core and bank indices.

/// Physical address type and helpers.
pub mod addr;

/// Configuration and checkpoint error types.
pub mod error;

/// Index of a core (sharer) or bank in the simulated system.
pub type NodeId = usize;

pub use addr::PhysAddr;
pub use error::{CheckpointError, ConfigError};
