//! Adaptive window: rate-limits how many ids enter each round.
//!
//! Every worker keeps a mirror of the window state and all mirrors evolve
//! identically: after each round the workers publish their iteration and
//! commit counts, and each one recomputes the step size `delta` from the
//! global commit ratio. A ratio at or above the target doubles the step
//! (commit-bound); anything lower shrinks it proportionally
//! (conflict-bound). Below the configured floor the step becomes zero on
//! inner rounds, a request to pull new work instead of widening, and the
//! floor itself on outer rounds.
//!
//! The fixed-neighborhood fast path replaces all of this with an unbounded
//! no-op window: the dependency graph already orders every conflict, so
//! rate-limiting only costs rounds.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

pub(crate) const CHUNK_SIZE: usize = 32;
pub(crate) const INITIAL_NUM_ROUNDS: usize = 100;
pub(crate) const DEFAULT_MIN_DELTA: usize = CHUNK_SIZE * 40;

const COMMIT_TARGET: f64 = 0.95;

pub(crate) trait WindowManager: Send + Sync {
    /// Start a fresh window span (initial work or a new outer round).
    /// Returns the first window cutoff.
    fn initial_window(&self, tid: usize, dist: usize, base: usize) -> usize;

    /// Advance the window by the current step and reset this worker's
    /// counters. Returns the new cutoff.
    fn next_window(&self, tid: usize) -> usize;

    /// Recompute this worker's step from all workers' published counters.
    /// Callers must barrier between the last counter update and this, and
    /// between this and the next counter reset.
    fn calculate(&self, tid: usize, inner: bool);

    fn note_iteration(&self, tid: usize);
    fn note_commit(&self, tid: usize);
}

#[derive(Default)]
struct Slot {
    window: AtomicUsize,
    delta: AtomicUsize,
    committed: AtomicUsize,
    iterations: AtomicUsize,
}

/// The adaptive policy.
pub(crate) struct AdaptiveWindow {
    slots: Vec<CachePadded<Slot>>,
    min_delta: usize,
    /// An explicitly configured floor doubles as the initial step.
    explicit_floor: bool,
}

impl AdaptiveWindow {
    pub(crate) fn new(workers: usize, min_delta: usize, explicit_floor: bool) -> Self {
        Self {
            slots: (0..workers).map(|_| CachePadded::new(Slot::default())).collect(),
            min_delta,
            explicit_floor,
        }
    }
}

impl WindowManager for AdaptiveWindow {
    fn initial_window(&self, tid: usize, dist: usize, base: usize) -> usize {
        let step = if self.explicit_floor {
            self.min_delta
        } else {
            (dist / INITIAL_NUM_ROUNDS).max(self.min_delta)
        };
        let w = step.saturating_add(base);
        let slot = &self.slots[tid];
        slot.window.store(w, Ordering::Relaxed);
        slot.delta.store(w, Ordering::Relaxed);
        slot.committed.store(0, Ordering::Relaxed);
        slot.iterations.store(0, Ordering::Relaxed);
        w
    }

    fn next_window(&self, tid: usize) -> usize {
        let slot = &self.slots[tid];
        let w = slot
            .window
            .load(Ordering::Relaxed)
            .saturating_add(slot.delta.load(Ordering::Relaxed));
        slot.window.store(w, Ordering::Relaxed);
        slot.committed.store(0, Ordering::Relaxed);
        slot.iterations.store(0, Ordering::Relaxed);
        w
    }

    fn calculate(&self, tid: usize, inner: bool) {
        let mut committed = 0usize;
        let mut iterations = 0usize;
        for slot in &self.slots {
            committed += slot.committed.load(Ordering::Relaxed);
            iterations += slot.iterations.load(Ordering::Relaxed);
        }

        let slot = &self.slots[tid];
        let mut delta = slot.delta.load(Ordering::Relaxed);

        if committed == 0 {
            // Ordinarily only empty rounds land here; a work function that
            // voluntarily conflicts can also produce a zero-commit round.
            delta = delta.saturating_mul(2);
        } else {
            let ratio = committed as f64 / iterations as f64;
            if ratio >= COMMIT_TARGET {
                delta = delta.saturating_mul(2);
            } else {
                delta = (ratio / COMMIT_TARGET * delta as f64) as usize;
            }
        }

        if !inner {
            if delta < self.min_delta {
                delta = self.min_delta;
            }
        } else if delta < self.min_delta {
            // Pull new work instead of widening the window.
            delta = 0;
        }

        if tid == 0 {
            tracing::trace!(
                committed,
                iterations,
                delta,
                inner,
                "window step recalculated"
            );
        }
        slot.delta.store(delta, Ordering::Relaxed);
    }

    fn note_iteration(&self, tid: usize) {
        self.slots[tid].iterations.fetch_add(1, Ordering::Relaxed);
    }

    fn note_commit(&self, tid: usize) {
        self.slots[tid].committed.fetch_add(1, Ordering::Relaxed);
    }
}

/// The no-op policy used by fixed-neighborhood runs.
pub(crate) struct UnboundedWindow;

impl WindowManager for UnboundedWindow {
    fn initial_window(&self, _tid: usize, _dist: usize, _base: usize) -> usize {
        usize::MAX
    }

    fn next_window(&self, _tid: usize) -> usize {
        usize::MAX
    }

    fn calculate(&self, _tid: usize, _inner: bool) {}
    fn note_iteration(&self, _tid: usize) {}
    fn note_commit(&self, _tid: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive(wm: &AdaptiveWindow, commits: usize, iterations: usize) {
        for _ in 0..commits {
            wm.note_commit(0);
        }
        for _ in 0..iterations {
            wm.note_iteration(0);
        }
    }

    #[test]
    fn initial_window_uses_the_span_heuristic() {
        let wm = AdaptiveWindow::new(1, DEFAULT_MIN_DELTA, false);
        // Large spans split into the initial number of rounds.
        assert_eq!(
            wm.initial_window(0, 1_000_000, 0),
            1_000_000 / INITIAL_NUM_ROUNDS
        );
        // Small spans clamp to the floor.
        assert_eq!(wm.initial_window(0, 10, 0), DEFAULT_MIN_DELTA);
        // The base offsets the cutoff.
        assert_eq!(wm.initial_window(0, 10, 100), DEFAULT_MIN_DELTA + 100);
    }

    #[test]
    fn explicit_floor_becomes_the_initial_step() {
        let wm = AdaptiveWindow::new(1, 8, true);
        assert_eq!(wm.initial_window(0, 1000, 0), 8);
    }

    #[test]
    fn commit_bound_rounds_double_the_step() {
        let wm = AdaptiveWindow::new(1, 8, true);
        wm.initial_window(0, 1000, 0);
        drive(&wm, 100, 100);
        wm.calculate(0, true);
        assert_eq!(wm.next_window(0), 8 + 16);
    }

    #[test]
    fn conflict_bound_rounds_shrink_the_step() {
        let wm = AdaptiveWindow::new(1, 8, true);
        wm.initial_window(0, 100_000, 0);
        drive(&wm, 4, 100);
        wm.calculate(0, true);
        // ratio 0.04 against a 0.95 target shrinks 8 to 0, which is below
        // the floor, so an inner round zeroes the step.
        assert_eq!(wm.next_window(0), 8);
    }

    #[test]
    fn outer_rounds_clamp_to_the_floor() {
        let wm = AdaptiveWindow::new(1, 8, true);
        wm.initial_window(0, 100_000, 0);
        drive(&wm, 4, 100);
        wm.calculate(0, false);
        assert_eq!(wm.next_window(0), 8 + 8);
    }

    #[test]
    fn empty_rounds_grow_the_step() {
        let wm = AdaptiveWindow::new(2, 8, true);
        wm.initial_window(0, 1000, 0);
        wm.calculate(0, true);
        assert_eq!(wm.next_window(0), 8 + 16);
    }

    #[test]
    fn counters_reset_on_advance() {
        let wm = AdaptiveWindow::new(1, 8, true);
        wm.initial_window(0, 1000, 0);
        drive(&wm, 3, 5);
        wm.next_window(0);
        drive(&wm, 10, 10);
        wm.calculate(0, true);
        // Only the post-advance counters (10/10) feed the ratio: doubled.
        let before = wm.slots[0].delta.load(Ordering::Relaxed);
        assert_eq!(before, 16);
    }

    #[test]
    fn unbounded_window_admits_everything() {
        let wm = UnboundedWindow;
        assert_eq!(wm.initial_window(0, 10, 0), usize::MAX);
        assert_eq!(wm.next_window(0), usize::MAX);
    }
}
