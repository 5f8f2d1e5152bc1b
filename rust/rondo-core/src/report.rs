//! Run report.

use serde::Serialize;

/// Counters accumulated over a run and returned from the executor.
///
/// Per-thread vectors are indexed by worker id. Rounds are counted once (all
/// workers execute the same round structure in lockstep, so every worker
/// observes the same totals).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Report {
    /// Inner rounds executed (one pending+commit cycle each).
    pub rounds: usize,
    /// Outer rounds executed (each ends by distributing freshly pushed work).
    pub outer_rounds: usize,
    /// Committed iterations per worker.
    pub committed: Vec<usize>,
    /// Conflicted (rescheduled) iterations per worker.
    pub conflicts: Vec<usize>,
}

impl Report {
    /// Total committed iterations across all workers.
    pub fn total_committed(&self) -> usize {
        self.committed.iter().sum()
    }

    /// Total conflicts across all workers.
    pub fn total_conflicts(&self) -> usize {
        self.conflicts.iter().sum()
    }
}
