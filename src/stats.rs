//! Runtime statistics counters, gated behind the `stats` feature (§9
//! "Statistics counters": context switches, spins taken, NBIO `select()`
//! calls, roll-forwards performed).
//!
//! Grounded on `constance`'s `cfg(feature = "system_log")`-gated counters in
//! its port layer: a small set of `AtomicU64`s updated with `Relaxed`
//! ordering on the hot path and read back wholesale for reporting, never
//! used for synchronization.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters (`Runtime::stats`).
#[derive(Default)]
pub struct Stats {
    /// Roll-forward actions executed across every processor (§4.I
    /// "Preemption").
    pub roll_forwards: AtomicU64,
    /// Spin-lock acquisitions that had to back off at least once
    /// (§4.B "Exponential backoff").
    pub spin_contentions: AtomicU64,
}

impl Stats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            roll_forwards: self.roll_forwards.load(Ordering::Relaxed),
            spin_contentions: self.spin_contentions.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time read of [`Stats`], safe to log or assert against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub roll_forwards: u64,
    pub spin_contentions: u64,
}

/// Per-processor counters (`Processor::stats`).
#[derive(Default)]
pub struct ProcessorStats {
    /// Coroutine resumptions performed by this processor's scheduling loop
    /// (§4.I step 2).
    pub context_switches: AtomicU64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStatsSnapshot {
        ProcessorStatsSnapshot {
            context_switches: self.context_switches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessorStatsSnapshot {
    pub context_switches: u64,
}
