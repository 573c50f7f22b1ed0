//! Directory controllers.
//!
//! This module ties the protocol machinery to cycle-level timing. It provides:
//! 1. **Work Records:** `ProcessEntry`, its reservations, and the all-or-nothing
//!    admission check.
//! 2. **Bank Controller:** `DirectoryController`, which admits work, runs the policy, and
//!    emits the resulting messages through its pipelines.
//! 3. **Banked Controller:** `BankedController`, which owns several banks and routes
//!    messages between external ports and banks by address.
//! 4. **Bank Mapping:** `BankMap`, the address-to-bank interleaving function.

/// Address-to-bank interleaving.
pub mod bank_map;

/// Multi-bank routing front end.
pub mod banked;

/// Single-bank controller.
pub mod directory_controller;

/// Work records and reservations.
pub mod process;

pub use bank_map::BankMap;
pub use banked::BankedController;
pub use directory_controller::{Channel, DirectoryController, OutputPorts, PortSet};
pub use process::{Action, Demand, ProcessEntry, ProcessKind, Reservations};
