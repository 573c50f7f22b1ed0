
/// Bank mapping, port routing, and arbitration of the banked controller.
pub mod banked;

/// Directory checkpoint save and restore.
pub mod checkpoint;


/// Directory organisations and the directory evict buffer.
pub mod directory;

/// Structured logging of controller decisions.
pub mod logging;


/// `NonInclusiveMESI` transactions.
pub mod mesi;

/// `SingleCMPRegion` transactions and decision table.
pub mod region;
