//! The round-structured speculative executor.
//!
//! Every worker runs the same code in lockstep, separated by a process-wide
//! barrier. One inner round is a pending phase (drain the current worklist,
//! wrap each item in a fresh context, run the neighborhood function and
//! record its acquires) and a commit phase (run the work function on every
//! context that survived arbitration, reschedule the rest). The window
//! manager rate-limits how many priority ids flow into each round; the
//! new-work pipeline turns pushes into deterministically numbered items
//! between outer rounds. Termination is reached when the worklists, the
//! per-worker reserves, and the new-work queue are all empty.
//!
//! The externally observable effect of a run is a fixed serial schedule of
//! the input: which items commit in which round depends only on the input,
//! the options, and the id function, never on the worker count or timing.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, OnceLock};
use std::thread;

use crossbeam_utils::CachePadded;
use rondo_core::{EngineError, OpResult, Report};

use crate::context::{CtxPtr, DetCtx, Item, RunKind};
use crate::dag;
use crate::facade::Facing;
use crate::newwork::{plan_initial, IdFn, InitPlan, NewWorkManager};
use crate::reader;
use crate::stats::{LoopStats, StatSink, TracingSink};
use crate::window::{AdaptiveWindow, UnboundedWindow, WindowManager, DEFAULT_MIN_DELTA};
use crate::worklist::ChunkQueue;

type BreakFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Configures and launches a deterministic run.
///
/// ```
/// use std::sync::Mutex;
/// use rondo_rt::Builder;
///
/// let log = Mutex::new(Vec::new());
/// let report = Builder::new(
///     |_v: &u64, _facing| Ok(()),
///     |v, _facing| {
///         log.lock().unwrap().push(*v);
///         Ok(())
///     },
/// )
/// .workers(2)
/// .id_fn(|v| *v as usize)
/// .run(vec![3u64, 1, 2])
/// .unwrap();
///
/// assert_eq!(report.total_committed(), 3);
/// let mut seen = log.into_inner().unwrap();
/// seen.sort_unstable();
/// assert_eq!(seen, vec![1, 2, 3]);
/// ```
pub struct Builder<V, F1, F2> {
    fn1: F1,
    fn2: F2,
    workers: usize,
    id_fn: Option<IdFn<V>>,
    fixed_neighborhood: bool,
    intent_to_read: bool,
    local_state: bool,
    break_fn: Option<BreakFn>,
    needs_push: bool,
    detect: bool,
    per_iter_alloc: bool,
    min_delta: Option<usize>,
    stats_name: Option<String>,
    sink: Option<Arc<dyn StatSink>>,
}

impl<V, F1, F2> Builder<V, F1, F2>
where
    V: Clone + Send + Sync,
    F1: Fn(&V, &mut Facing<V>) -> OpResult + Sync,
    F2: Fn(&V, &mut Facing<V>) -> OpResult + Sync,
{
    /// Create a builder from the neighborhood function `fn1` and the work
    /// function `fn2`.
    pub fn new(fn1: F1, fn2: F2) -> Self {
        Self {
            fn1,
            fn2,
            workers: 0,
            id_fn: None,
            fixed_neighborhood: false,
            intent_to_read: false,
            local_state: false,
            break_fn: None,
            needs_push: true,
            detect: true,
            per_iter_alloc: false,
            min_delta: None,
            stats_name: None,
            sink: None,
        }
    }

    /// Number of worker threads. Zero (the default) uses the CPU count.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Derive each item's priority id from its value. Required for the
    /// fixed-neighborhood fast path.
    pub fn id_fn(mut self, f: impl Fn(&V) -> usize + Send + Sync + 'static) -> Self {
        self.id_fn = Some(Arc::new(f));
        self
    }

    /// Declare that the set of resources `fn1` acquires depends only on the
    /// value; enables the dependency-graph fast path.
    pub fn fixed_neighborhood(mut self) -> Self {
        self.fixed_neighborhood = true;
        self
    }

    /// Let `Read`-mode acquires of one resource share it.
    pub fn intent_to_read(mut self) -> Self {
        self.intent_to_read = true;
        self
    }

    /// Enable the local-state slot handed from the pending pass to commit.
    pub fn local_state(mut self) -> Self {
        self.local_state = true;
        self
    }

    /// Stop predicate, evaluated by worker 0 after every inner loop.
    pub fn parallel_break(mut self, f: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.break_fn = Some(Arc::new(f));
        self
    }

    /// Whether the work function may push new items (default: true).
    pub fn needs_push(mut self, needs_push: bool) -> Self {
        self.needs_push = needs_push;
        self
    }

    /// Downgrade all acquires to no-ops. Determinism becomes the caller's
    /// responsibility.
    pub fn no_conflict_detection(mut self) -> Self {
        self.detect = false;
        self
    }

    /// Expose the per-iteration allocator on the façade.
    pub fn per_iter_alloc(mut self) -> Self {
        self.per_iter_alloc = true;
        self
    }

    /// Floor for the adaptive window step. Also becomes the initial step,
    /// turning the window into an explicit rate limit.
    pub fn min_delta(mut self, min_delta: usize) -> Self {
        self.min_delta = Some(min_delta);
        self
    }

    /// Name under which the run report is delivered to the statistics sink.
    pub fn stats(mut self, name: impl Into<String>) -> Self {
        self.stats_name = Some(name.into());
        self
    }

    /// Replace the default `tracing` statistics sink.
    pub fn stat_sink(mut self, sink: Arc<dyn StatSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Execute the loop over `initial` and return the run report.
    pub fn run(self, initial: impl IntoIterator<Item = V>) -> Result<Report, EngineError> {
        let Builder {
            fn1,
            fn2,
            workers,
            id_fn,
            fixed_neighborhood,
            intent_to_read,
            local_state,
            break_fn,
            needs_push,
            detect,
            per_iter_alloc,
            min_delta,
            stats_name,
            sink,
        } = self;

        if fixed_neighborhood && id_fn.is_none() {
            return Err(EngineError::Config(
                "a fixed neighborhood requires an id function".into(),
            ));
        }
        if fixed_neighborhood && intent_to_read {
            return Err(EngineError::Config(
                "fixed neighborhood and intent to read cannot be combined".into(),
            ));
        }
        if min_delta == Some(0) {
            return Err(EngineError::Config("min_delta must be positive".into()));
        }

        let workers = if workers == 0 {
            num_cpus::get().max(1)
        } else {
            workers
        };
        let kind = if fixed_neighborhood {
            RunKind::Dag
        } else if intent_to_read {
            RunKind::Reader
        } else {
            RunKind::Ordered
        };
        let window: Box<dyn WindowManager> = if fixed_neighborhood {
            Box::new(UnboundedWindow)
        } else {
            Box::new(AdaptiveWindow::new(
                workers,
                min_delta.unwrap_or(DEFAULT_MIN_DELTA),
                min_delta.is_some(),
            ))
        };

        let values: Vec<V> = initial.into_iter().collect();
        let plan = plan_initial(values, id_fn.as_ref(), fixed_neighborhood);

        let mut engine = Engine {
            fn1,
            fn2,
            kind,
            needs_push,
            detect,
            per_iter_alloc,
            local_state,
            worklists: [ChunkQueue::new(), ChunkQueue::new()],
            newwork: NewWorkManager::new(workers, id_fn),
            window,
            plan,
            barrier: Barrier::new(workers),
            inner_done: CachePadded::new(AtomicBool::new(false)),
            outer_done: CachePadded::new(AtomicBool::new(false)),
            new_work_flag: CachePadded::new(AtomicBool::new(false)),
            break_flag: CachePadded::new(AtomicBool::new(false)),
            break_fn,
            fatal: OnceLock::new(),
            sources: ChunkQueue::new(),
            dag_remaining: AtomicUsize::new(0),
        };

        let mut outcomes: Vec<(LoopStats, usize, usize)> = Vec::with_capacity(workers);
        thread::scope(|scope| {
            let engine = &engine;
            let handles: Vec<_> = (0..workers)
                .map(|tid| {
                    thread::Builder::new()
                        .name(format!("rondo-worker-{tid}"))
                        .spawn_scoped(scope, move || engine.worker(tid))
                        .expect("failed to spawn worker thread")
                })
                .collect();
            for handle in handles {
                outcomes.push(handle.join().expect("worker thread panicked"));
            }
        });

        if let Some(err) = engine.fatal.take() {
            return Err(err);
        }

        let report = Report {
            rounds: outcomes.first().map_or(0, |o| o.1),
            outer_rounds: outcomes.first().map_or(0, |o| o.2),
            committed: outcomes.iter().map(|o| o.0.committed).collect(),
            conflicts: outcomes.iter().map(|o| o.0.conflicts).collect(),
        };
        if let Some(name) = stats_name {
            match sink {
                Some(sink) => sink.report(&name, &report),
                None => TracingSink.report(&name, &report),
            }
        }
        Ok(report)
    }
}

/// Worker-local state.
struct Tld<V> {
    facing: Facing<V>,
    pending: Vec<Box<DetCtx<V>>>,
    stats: LoopStats,
    rounds: usize,
    outer_rounds: usize,
    has_new_work: bool,
    cur: usize,
    next: usize,
    scratch: Vec<(usize, CtxPtr<V>)>,
}

/// Everything the workers share for one run.
struct Engine<V, F1, F2> {
    fn1: F1,
    fn2: F2,
    kind: RunKind,
    needs_push: bool,
    detect: bool,
    per_iter_alloc: bool,
    local_state: bool,
    worklists: [ChunkQueue<Item<V>>; 2],
    newwork: NewWorkManager<V>,
    window: Box<dyn WindowManager>,
    plan: InitPlan<V>,
    barrier: Barrier,
    inner_done: CachePadded<AtomicBool>,
    outer_done: CachePadded<AtomicBool>,
    new_work_flag: CachePadded<AtomicBool>,
    break_flag: CachePadded<AtomicBool>,
    break_fn: Option<BreakFn>,
    /// First fatal error wins; the round structure then winds down empty so
    /// no worker is left stranded at a barrier.
    fatal: OnceLock<EngineError>,
    sources: ChunkQueue<CtxPtr<V>>,
    dag_remaining: AtomicUsize,
}

impl<V, F1, F2> Engine<V, F1, F2>
where
    V: Clone + Send + Sync,
    F1: Fn(&V, &mut Facing<V>) -> OpResult + Sync,
    F2: Fn(&V, &mut Facing<V>) -> OpResult + Sync,
{
    fn worker(&self, tid: usize) -> (LoopStats, usize, usize) {
        let mut tld = Tld {
            facing: Facing::new(self.kind, self.detect, self.per_iter_alloc),
            pending: Vec::new(),
            stats: LoopStats::default(),
            rounds: 0,
            outer_rounds: 0,
            has_new_work: false,
            cur: 0,
            next: 1,
            scratch: Vec::new(),
        };

        self.newwork
            .add_initial(tid, &self.plan, &*self.window, &self.worklists[1]);
        self.barrier.wait();

        'outer: loop {
            tld.outer_rounds += 1;

            loop {
                tld.rounds += 1;
                mem::swap(&mut tld.cur, &mut tld.next);
                let next_pending = self.pending_loop(tid, &mut tld);
                self.inner_done.store(true, Ordering::Relaxed);
                self.barrier.wait();

                match self.kind {
                    RunKind::Dag => {
                        dag::build_chains(&tld.pending, &mut tld.scratch);
                        self.barrier.wait();
                    }
                    RunKind::Reader => {
                        reader::build_sweep(&tld.pending);
                        self.barrier.wait();
                        reader::propagate_sweep(&tld.pending);
                        self.barrier.wait();
                    }
                    RunKind::Ordered => {}
                }

                self.outer_done.store(true, Ordering::Relaxed);

                if self.kind == RunKind::Dag {
                    self.execute_dag(tid, &mut tld);
                    if self.break_fn.is_some() {
                        self.barrier.wait();
                    }
                    tld.pending.clear();
                    break;
                }

                let next_commit = self.commit_loop(tid, &mut tld);
                if next_pending || next_commit {
                    self.inner_done.store(false, Ordering::Relaxed);
                }
                self.barrier.wait();
                if self.inner_done.load(Ordering::Relaxed) {
                    break;
                }

                self.window.calculate(tid, true);
                self.barrier.wait();
                let window = self.window.next_window(tid);
                self.newwork
                    .push_next_window(tid, &self.worklists[tld.next], window);
            }

            if self.fatal.get().is_some() {
                self.newwork.purge_reserve(tid);
            }
            if !self.newwork.reserve_empty(tid) {
                self.outer_done.store(false, Ordering::Relaxed);
            }
            if tld.has_new_work && self.fatal.get().is_none() {
                self.new_work_flag.store(true, Ordering::Relaxed);
            }
            if self.check_break(tid) {
                break 'outer;
            }
            self.barrier.wait();

            if self.outer_done.load(Ordering::Relaxed) {
                if !self.needs_push || !self.new_work_flag.load(Ordering::Relaxed) {
                    break;
                }
                self.newwork
                    .distribute(tid, &self.barrier, &*self.window, &self.worklists[tld.next]);
                tld.has_new_work = false;
                self.new_work_flag.store(false, Ordering::Relaxed);
            } else {
                self.window.calculate(tid, false);
                self.barrier.wait();
                let window = self.window.next_window(tid);
                self.newwork
                    .push_next_window(tid, &self.worklists[tld.next], window);
            }
        }

        (tld.stats, tld.rounds, tld.outer_rounds)
    }

    /// Drain the current worklist, running the neighborhood function on a
    /// fresh context per item. Returns whether any iteration must retry.
    fn pending_loop(&self, tid: usize, tld: &mut Tld<V>) -> bool {
        let mut reschedule = false;
        while let Some(item) = self.worklists[tld.cur].pop() {
            if self.fatal.get().is_some() {
                // The run is winding down; drop the work.
                continue;
            }
            // A fresh context per item: reusing one across an aborted
            // iteration races with late readers of its handle.
            tld.pending.push(DetCtx::new(item, self.kind));
            self.window.note_iteration(tid);
            if self.kind == RunKind::Dag {
                self.dag_remaining.fetch_add(1, Ordering::Relaxed);
            }

            let ctx = tld.pending.last_mut().unwrap();
            tld.facing.begin_pending(&**ctx as *const DetCtx<V>);
            let result = (self.fn1)(&ctx.item.value, &mut tld.facing);
            tld.facing.end_first_pass();
            ctx.set_first_pass(false);
            if let Some(err) = tld.facing.take_fatal() {
                let _ = self.fatal.set(err);
            }

            let retryable = result.is_err();
            if !retryable || self.kind == RunKind::Dag {
                *ctx.item.local.lock().unwrap() = tld.facing.take_local();
            } else {
                ctx.handle.mark_not_ready();
                tld.facing.clear_local();
                reschedule = true;
            }
            if self.per_iter_alloc && !self.local_state {
                tld.facing.reset_alloc();
            }
        }
        reschedule
    }

    /// Visit this worker's contexts in insertion order: commit the ready
    /// ones, reschedule the rest. Returns whether anything was rescheduled.
    fn commit_loop(&self, tid: usize, tld: &mut Tld<V>) -> bool {
        let mut reschedule = false;
        for ctx in tld.pending.drain(..) {
            let mut committed = false;
            if self.fatal.get().is_none() && ctx.is_ready() {
                committed = self.execute_task(&ctx, &mut tld.facing, &mut tld.has_new_work);
            }
            ctx.release_owned();

            if committed {
                self.window.note_commit(tid);
                tld.stats.committed += 1;
            } else if self.fatal.get().is_none() {
                let DetCtx { item, .. } = *ctx;
                *item.local.lock().unwrap() = None;
                self.worklists[tld.next].push(item);
                tld.stats.conflicts += 1;
                reschedule = true;
            }

            if self.per_iter_alloc && !self.local_state {
                tld.facing.reset_alloc();
            }
            tld.facing.reset_push();
            tld.facing.clear_local();
        }
        if self.per_iter_alloc && self.local_state {
            tld.facing.reset_alloc();
        }
        tld.facing.clear_current();
        reschedule
    }

    /// Run the work function on one context and stream its pushes into the
    /// new-work pipeline. Returns whether the iteration committed.
    fn execute_task(&self, ctx: &DetCtx<V>, facing: &mut Facing<V>, has_new_work: &mut bool) -> bool {
        let local = ctx.item.local.lock().unwrap().take();
        facing.begin_commit(ctx as *const DetCtx<V>, local);
        let result = (self.fn2)(&ctx.item.value, facing);
        if let Some(err) = facing.take_fatal() {
            let _ = self.fatal.set(err);
            return false;
        }
        if result.is_err() {
            return false;
        }

        if self.needs_push {
            let parent = ctx.item.id;
            let mut count: u32 = 0;
            for value in facing.drain_push() {
                count = match count.checked_add(1) {
                    Some(c) => c,
                    None => {
                        let _ = self.fatal.set(EngineError::CounterOverflow { parent });
                        return false;
                    }
                };
                self.newwork.push_new(value, parent, count);
            }
            if count > 0 {
                *has_new_work = true;
            }
        } else {
            debug_assert!(
                facing.push_is_empty(),
                "the work function pushed new items with pushes disabled"
            );
        }
        true
    }

    /// Drive the dependency graph from its sources until every context of
    /// the round has committed.
    fn execute_dag(&self, tid: usize, tld: &mut Tld<V>) {
        dag::scan_sources(&tld.pending, &self.sources);
        self.barrier.wait();

        loop {
            while let Some(source) = self.sources.pop() {
                // SAFETY: contexts stay alive until every worker has left
                // this loop, which the remaining-count guarantees.
                let ctx = unsafe { &*source.0 };
                if self.fatal.get().is_none() {
                    let committed =
                        self.execute_task(ctx, &mut tld.facing, &mut tld.has_new_work);
                    // A conflict here means the neighborhood was not fixed
                    // after all.
                    debug_assert!(
                        committed || self.fatal.get().is_some(),
                        "commit failed in a fixed-neighborhood round"
                    );
                    self.window.note_commit(tid);
                    tld.stats.committed += 1;
                }
                if self.per_iter_alloc && !self.local_state {
                    tld.facing.reset_alloc();
                }
                tld.facing.reset_push();
                tld.facing.clear_local();

                for &succ in ctx.dag().succs.lock().unwrap().iter() {
                    // SAFETY: successors are contexts of this round.
                    let preds = unsafe { &(*succ.0).dag().preds };
                    if preds.fetch_sub(1, Ordering::AcqRel) == 1 {
                        self.sources.push(succ);
                    }
                }
                self.dag_remaining.fetch_sub(1, Ordering::Release);
            }
            if self.dag_remaining.load(Ordering::Acquire) == 0 {
                break;
            }
            std::hint::spin_loop();
            thread::yield_now();
        }

        if self.per_iter_alloc && self.local_state {
            tld.facing.reset_alloc();
        }
        tld.facing.clear_current();
    }

    /// Evaluate the registered break predicate on worker 0 and publish the
    /// verdict to everyone.
    fn check_break(&self, tid: usize) -> bool {
        let Some(break_fn) = &self.break_fn else {
            return false;
        };
        if tid == 0 {
            self.break_flag.store(break_fn(), Ordering::Relaxed);
        }
        self.barrier.wait();
        self.break_flag.load(Ordering::Relaxed)
    }
}
