//! Directory-based cache-coherence protocol engine.
//!
//! This crate implements the banked home-node directory of a chip multiprocessor at cycle
//! level, with the following:
//! 1. **Tracking:** Sharer sets, directory organisations, evict buffers, and the miss
//!    address file of in-flight transactions.
//! 2. **Protocols:** A code-driven non-inclusive MESI policy and a decision-table
//!    region policy behind one `Policy` trait.
//! 3. **Controllers:** A pipelined single-bank controller with all-or-nothing resource
//!    admission, and a banked front end that routes messages by address.
//! 4. **Infrastructure:** JSON configuration, checkpoints, and statistics.

/// Data array models and the cache evict buffer.
pub mod array;
/// Common types (addresses, node ids, errors).
pub mod common;
/// Engine configuration (defaults and hierarchical config structures).
pub mod config;
/// Bank controllers, work records, and bank mapping.
pub mod controller;
/// Directory organisations, directory evict buffer, and checkpoints.
pub mod directory;
/// Miss address file.
pub mod maf;
/// Protocol policies and decision tables.
pub mod policy;
/// Messages, destinations, and transports.
pub mod protocol;
/// Reservable message queues and timed pipelines.
pub mod queues;
/// Sharer sets.
pub mod state;
/// Controller statistics collection and reporting.
pub mod stats;

/// Root configuration type; use `Config::default()` or deserialize from JSON.
pub use crate::config::Config;
/// Multi-bank controller; construct with `BankedController::new`.
pub use crate::controller::BankedController;
/// Single-bank controller.
pub use crate::controller::DirectoryController;
/// Message bundle exchanged with the controllers.
pub use crate::protocol::Transport;
