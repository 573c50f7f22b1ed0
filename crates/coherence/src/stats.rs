//! Controller statistics collection and reporting.
//!
//! This module tracks what each bank spent its cycles on. It provides:
//! 1. **Scheduling:** Records admitted, by kind.
//! 2. **Decisions:** Policy actions taken, by kind.
//! 3. **Stalls:** Admission attempts refused for lack of resources, by category.
//! 4. **Protocol Events:** MAF queueing, back-invalidations, and forwarded evictions.
//!
//! `ControllerStats` values add, so a banked controller reports the sum of its banks.

use std::ops::AddAssign;

use crate::controller::process::{Action, ProcessKind};

/// Admission attempts refused, by category.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StallCounts {
    /// A waking MAF entry could not be scheduled.
    pub waking: u64,
    /// A request waited in its input queue.
    pub request: u64,
    /// A snoop waited in its input queue.
    pub snoop: u64,
    /// A reply waited in its input queue.
    pub reply: u64,
    /// Idle work was available but not scheduled.
    pub idle: u64,
}

/// Per-bank counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// Cycles driven.
    pub cycles: u64,
    /// Records admitted, indexed by [`ProcessKind::index`].
    pub processes: [u64; ProcessKind::ALL.len()],
    /// Actions taken, indexed by [`Action::index`].
    pub actions: [u64; Action::ALL.len()],
    /// Admission stalls.
    pub stalls: StallCounts,
    /// Requests parked in the MAF as `WaitingForRequest` behind another transaction on the
    /// same address.
    pub maf_hits: u64,
    /// Back-invalidation rounds issued.
    pub back_invalidations: u64,
    /// Evictions written back to memory.
    pub evicts_forwarded: u64,
}

impl ControllerStats {
    /// Counts an admitted record.
    #[inline]
    pub fn record_process(&mut self, kind: ProcessKind) {
        self.processes[kind.index()] += 1;
    }

    /// Counts a policy decision.
    #[inline]
    pub fn record_action(&mut self, action: Action) {
        self.actions[action.index()] += 1;
    }

    /// Records admitted of `kind`.
    pub const fn processes_of(&self, kind: ProcessKind) -> u64 {
        self.processes[kind.index()]
    }

    /// Decisions of `action`.
    pub const fn actions_of(&self, action: Action) -> u64 {
        self.actions[action.index()]
    }

    /// Records admitted across all kinds.
    pub fn total_processes(&self) -> u64 {
        self.processes.iter().sum()
    }

    /// Prints every counter to stdout.
    pub fn print(&self) {
        println!("\n==========================================================");
        println!("DIRECTORY CONTROLLER STATISTICS");
        println!("==========================================================");
        println!("cycles                   {}", self.cycles);
        println!("processes                {}", self.total_processes());
        println!("----------------------------------------------------------");
        println!("SCHEDULED");
        for kind in ProcessKind::ALL {
            println!("  {:<22} {}", format!("{kind:?}"), self.processes_of(kind));
        }
        println!("----------------------------------------------------------");
        println!("ACTIONS");
        for action in Action::ALL {
            let n = self.actions_of(action);
            if n > 0 {
                println!("  {:<22} {n}", action.to_string());
            }
        }
        println!("----------------------------------------------------------");
        println!("STALLS");
        println!("  stall.waking           {}", self.stalls.waking);
        println!("  stall.request          {}", self.stalls.request);
        println!("  stall.snoop            {}", self.stalls.snoop);
        println!("  stall.reply            {}", self.stalls.reply);
        println!("  stall.idle             {}", self.stalls.idle);
        println!("----------------------------------------------------------");
        println!("PROTOCOL");
        println!("  maf.hits               {}", self.maf_hits);
        println!("  back_invalidations     {}", self.back_invalidations);
        println!("  evicts_forwarded       {}", self.evicts_forwarded);
        println!("==========================================================");
    }
}

impl AddAssign<&Self> for StallCounts {
    fn add_assign(&mut self, rhs: &Self) {
        self.waking += rhs.waking;
        self.request += rhs.request;
        self.snoop += rhs.snoop;
        self.reply += rhs.reply;
        self.idle += rhs.idle;
    }
}

impl AddAssign<&Self> for ControllerStats {
    fn add_assign(&mut self, rhs: &Self) {
        self.cycles = self.cycles.max(rhs.cycles);
        for (a, b) in self.processes.iter_mut().zip(rhs.processes) {
            *a += b;
        }
        for (a, b) in self.actions.iter_mut().zip(rhs.actions) {
            *a += b;
        }
        self.stalls += &rhs.stalls;
        self.maf_hits += rhs.maf_hits;
        self.back_invalidations += rhs.back_invalidations;
        self.evicts_forwarded += rhs.evicts_forwarded;
    }
}
