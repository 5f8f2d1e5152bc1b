//! The new-work pipeline.
//!
//! Items pushed by the work function are streamed into a shared queue as
//! `(value, parent, count)` triples, where `count` numbers the pushes of one
//! committing parent. Between outer rounds every worker drains a share of
//! the queue and sorts it, the master merges the shares into one globally
//! sorted sequence, and deterministic priority ids are assigned: the id
//! function's value when one was supplied, the position in the merged order
//! otherwise. Position ids are then spread across workers through a block
//! permutation (block size = window, stride = worker count) so no worker's
//! share clumps at one end of the priority order. Each worker finally copies
//! its share below the upcoming window into the next worklist and parks the
//! rest in its reserve.
//!
//! Initial work flows through the same machinery, prepared once before the
//! workers start.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex, RwLock};

use crate::context::Item;
use crate::window::WindowManager;
use crate::worklist::ChunkQueue;

pub(crate) type IdFn<V> = Arc<dyn Fn(&V) -> usize + Send + Sync>;

/// A freshly pushed unit of work, ordered by `(parent, count)`.
pub(crate) struct NewItem<V> {
    pub value: V,
    pub parent: usize,
    pub count: u32,
}

impl<V> NewItem<V> {
    pub(crate) fn new(value: V, parent: usize, count: u32) -> Self {
        Self {
            value,
            parent,
            count,
        }
    }

    pub(crate) fn key(&self) -> (usize, u32) {
        (self.parent, self.count)
    }
}

/// Stable merge of two key-sorted runs.
fn merge_sorted<V>(a: Vec<NewItem<V>>, b: Vec<NewItem<V>>) -> Vec<NewItem<V>> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let mut a = a.into_iter().peekable();
    let mut b = b.into_iter().peekable();
    loop {
        match (a.peek(), b.peek()) {
            (Some(x), Some(y)) => {
                if x.key() <= y.key() {
                    out.push(a.next().unwrap());
                } else {
                    out.push(b.next().unwrap());
                }
            }
            (Some(_), None) => out.push(a.next().unwrap()),
            (None, Some(_)) => out.push(b.next().unwrap()),
            (None, None) => return out,
        }
    }
}

/// Invert the block permutation that spreads contiguous id ranges across
/// workers: position `p` of the permuted order came from `unblock(p)` of
/// the merged order.
fn unblock(pos: usize, dist: usize, block: usize) -> usize {
    if block == 0 {
        return pos;
    }
    let blocks = dist / block;
    if blocks == 0 {
        return pos;
    }
    let limit = blocks * block;
    if pos >= limit {
        pos
    } else {
        (pos % block) * blocks + pos / block
    }
}

/// How initial work enters the first round.
pub(crate) enum InitPlan<V> {
    /// An id function orders the values; ids are positions in that order and
    /// the window is based at the smallest user id.
    WithId { merged: Vec<NewItem<V>>, min_id: usize },
    /// Fixed-neighborhood runs take the input order directly.
    Sequential { values: Vec<V> },
    /// Without an id function, input positions are ids, block-permuted.
    Redistributed { values: Vec<V> },
}

/// Prepare the initial workset. Runs once, before the workers start.
pub(crate) fn plan_initial<V>(
    values: Vec<V>,
    id_fn: Option<&IdFn<V>>,
    fixed: bool,
) -> InitPlan<V> {
    if fixed {
        return InitPlan::Sequential { values };
    }
    match id_fn {
        Some(f) => {
            let mut merged: Vec<NewItem<V>> = values
                .into_iter()
                .map(|v| {
                    let id = f(&v);
                    NewItem::new(v, id, 1)
                })
                .collect();
            merged.sort_by_key(NewItem::key);
            let min_id = merged.first().map_or(0, |n| n.parent);
            InitPlan::WithId { merged, min_id }
        }
        None => InitPlan::Redistributed { values },
    }
}

/// Shared state of the pipeline.
pub(crate) struct NewWorkManager<V> {
    queue: ChunkQueue<NewItem<V>>,
    /// Per-worker sorted drains, merged by the master between barriers.
    drained: Vec<Mutex<Vec<NewItem<V>>>>,
    /// The master's merged order, read by every worker in the copy phase.
    merged: RwLock<Vec<NewItem<V>>>,
    /// Per-worker overflow for items beyond the window, ascending by id.
    reserves: Vec<Mutex<VecDeque<Item<V>>>>,
    min_id: AtomicUsize,
    max_id: AtomicUsize,
    size: AtomicUsize,
    id_fn: Option<IdFn<V>>,
    workers: usize,
}

impl<V: Clone + Send + Sync> NewWorkManager<V> {
    pub(crate) fn new(workers: usize, id_fn: Option<IdFn<V>>) -> Self {
        Self {
            queue: ChunkQueue::new(),
            drained: (0..workers).map(|_| Mutex::new(Vec::new())).collect(),
            merged: RwLock::new(Vec::new()),
            reserves: (0..workers).map(|_| Mutex::new(VecDeque::new())).collect(),
            min_id: AtomicUsize::new(0),
            max_id: AtomicUsize::new(0),
            size: AtomicUsize::new(0),
            id_fn,
            workers,
        }
    }

    /// Enqueue one push from a committing parent.
    pub(crate) fn push_new(&self, value: V, parent: usize, count: u32) {
        match &self.id_fn {
            Some(f) => {
                let id = f(&value);
                self.queue.push(NewItem::new(value, id, 1));
            }
            None => self.queue.push(NewItem::new(value, parent, count)),
        }
    }

    pub(crate) fn reserve_empty(&self, tid: usize) -> bool {
        self.reserves[tid].lock().unwrap().is_empty()
    }

    pub(crate) fn purge_reserve(&self, tid: usize) {
        self.reserves[tid].lock().unwrap().clear();
    }

    /// Move reserved items whose id now fits the window into the worklist.
    pub(crate) fn push_next_window(&self, tid: usize, wl: &ChunkQueue<Item<V>>, window: usize) {
        let mut reserve = self.reserves[tid].lock().unwrap();
        while let Some(front) = reserve.front() {
            if front.id >= window {
                break;
            }
            wl.push(reserve.pop_front().unwrap());
        }
    }

    /// Seed the first round with this worker's strided share of the plan.
    pub(crate) fn add_initial(
        &self,
        tid: usize,
        plan: &InitPlan<V>,
        wm: &dyn WindowManager,
        wl: &ChunkQueue<Item<V>>,
    ) {
        match plan {
            InitPlan::WithId { merged, min_id } => {
                let window = wm.initial_window(tid, merged.len(), *min_id);
                let mut reserve = self.reserves[tid].lock().unwrap();
                for p in (tid..merged.len()).step_by(self.workers) {
                    let item = Item::new(merged[p].value.clone(), p);
                    if p < window {
                        wl.push(item);
                    } else {
                        reserve.push_back(item);
                    }
                }
            }
            InitPlan::Sequential { values } => {
                let window = wm.initial_window(tid, values.len(), 0);
                let mut reserve = self.reserves[tid].lock().unwrap();
                for p in (tid..values.len()).step_by(self.workers) {
                    let item = Item::new(values[p].clone(), p);
                    if p < window {
                        wl.push(item);
                    } else {
                        reserve.push_back(item);
                    }
                }
            }
            InitPlan::Redistributed { values } => {
                let window = wm.initial_window(tid, values.len(), 0);
                self.copy_permuted(tid, values.len(), window, wl, |src| values[src].clone());
            }
        }
    }

    /// Sort, merge, assign ids, and distribute everything pushed since the
    /// last outer round. All workers must call this together; it
    /// synchronizes internally on `barrier`.
    pub(crate) fn distribute(
        &self,
        tid: usize,
        barrier: &Barrier,
        wm: &dyn WindowManager,
        wl: &ChunkQueue<Item<V>>,
    ) {
        // Drain a share of the queue and sort it locally.
        let mut local = Vec::new();
        while let Some(item) = self.queue.pop() {
            local.push(item);
        }
        local.sort_by_key(NewItem::key);
        *self.drained[tid].lock().unwrap() = local;

        barrier.wait();

        if tid == 0 {
            debug_assert!(self.queue.is_empty(), "drain must finish before the merge");
            let mut merged: Vec<NewItem<V>> = Vec::new();
            for slot in &self.drained {
                let run = std::mem::take(&mut *slot.lock().unwrap());
                merged = merge_sorted(merged, run);
            }
            if self.id_fn.is_some() {
                // Ids arbitrate ties; one item per id survives.
                merged.dedup_by(|a, b| a.parent == b.parent);
            }
            self.size.store(merged.len(), Ordering::Relaxed);
            self.min_id
                .store(merged.first().map_or(0, |n| n.parent), Ordering::Relaxed);
            self.max_id
                .store(merged.last().map_or(0, |n| n.parent), Ordering::Relaxed);
            tracing::debug!(items = merged.len(), "distributing new work");
            *self.merged.write().unwrap() = merged;
        }

        barrier.wait();

        let size = self.size.load(Ordering::Relaxed);
        let merged = self.merged.read().unwrap();
        if self.id_fn.is_some() {
            let min = self.min_id.load(Ordering::Relaxed);
            let max = self.max_id.load(Ordering::Relaxed);
            let window = wm.initial_window(tid, max - min, min);
            let mut reserve = self.reserves[tid].lock().unwrap();
            for p in (tid..size).step_by(self.workers) {
                let entry = &merged[p];
                let item = Item::new(entry.value.clone(), entry.parent);
                if entry.parent < window {
                    wl.push(item);
                } else {
                    reserve.push_back(item);
                }
            }
        } else {
            let window = wm.initial_window(tid, size, 0);
            self.copy_permuted(tid, size, window, wl, |src| merged[src].value.clone());
        }
    }

    /// Copy this worker's strided share of a position-id'd sequence, block
    /// permutation applied, splitting on the window.
    fn copy_permuted(
        &self,
        tid: usize,
        dist: usize,
        window: usize,
        wl: &ChunkQueue<Item<V>>,
        get: impl Fn(usize) -> V,
    ) {
        let mut reserve = self.reserves[tid].lock().unwrap();
        for p in (tid..dist).step_by(self.workers) {
            let item = Item::new(get(unblock(p, dist, window)), p);
            if p < window {
                wl.push(item);
            } else {
                reserve.push_back(item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::window::{AdaptiveWindow, UnboundedWindow};

    fn drain_ids(wl: &ChunkQueue<Item<u64>>) -> Vec<(u64, usize)> {
        let mut out = Vec::new();
        while let Some(item) = wl.pop() {
            out.push((item.value, item.id));
        }
        out.sort_by_key(|&(_, id)| id);
        out
    }

    #[test]
    fn new_items_order_by_parent_then_count() {
        let mut items = vec![
            NewItem::new(0u64, 2, 1),
            NewItem::new(0, 1, 2),
            NewItem::new(0, 1, 1),
        ];
        items.sort_by_key(NewItem::key);
        let keys: Vec<_> = items.iter().map(NewItem::key).collect();
        assert_eq!(keys, vec![(1, 1), (1, 2), (2, 1)]);
    }

    #[test]
    fn merge_sorted_preserves_global_order() {
        let a = vec![NewItem::new(0u64, 1, 1), NewItem::new(0, 4, 1)];
        let b = vec![NewItem::new(0u64, 2, 1), NewItem::new(0, 3, 1)];
        let merged = merge_sorted(a, b);
        let parents: Vec<_> = merged.iter().map(|n| n.parent).collect();
        assert_eq!(parents, vec![1, 2, 3, 4]);
    }

    #[test]
    fn unblock_inverts_the_block_permutation() {
        // Forward definition: position `cur` of the merged order lands at
        // `(cur % blocks) * block + cur / blocks` inside the full blocks.
        let (dist, block) = (10, 2);
        let blocks = dist / block;
        for cur in 0..dist {
            let pos = if cur < blocks * block {
                (cur % blocks) * block + cur / blocks
            } else {
                cur
            };
            assert_eq!(unblock(pos, dist, block), cur);
        }
    }

    #[test]
    fn unblock_degenerates_to_identity() {
        assert_eq!(unblock(5, 10, 0), 5);
        assert_eq!(unblock(5, 10, 100), 5);
        assert_eq!(unblock(5, 10, usize::MAX), 5);
    }

    #[test]
    fn plan_with_id_sorts_by_user_id() {
        let id_fn: IdFn<u64> = Arc::new(|v| *v as usize);
        let plan = plan_initial(vec![30u64, 10, 20], Some(&id_fn), false);
        match plan {
            InitPlan::WithId { merged, min_id } => {
                let values: Vec<_> = merged.iter().map(|n| n.value).collect();
                assert_eq!(values, vec![10, 20, 30]);
                assert_eq!(min_id, 10);
            }
            _ => panic!("expected the id-ordered plan"),
        }
    }

    #[test]
    fn add_initial_splits_on_the_window() {
        let id_fn: IdFn<u64> = Arc::new(|v| *v as usize);
        let values: Vec<u64> = (0..20).collect();
        let plan = plan_initial(values, Some(&id_fn), false);
        let mgr = NewWorkManager::new(1, Some(id_fn));
        let wm = AdaptiveWindow::new(1, 8, true);
        let wl = ChunkQueue::new();

        mgr.add_initial(0, &plan, &wm, &wl);

        let admitted = drain_ids(&wl);
        assert_eq!(admitted.len(), 8);
        assert_eq!(admitted[0], (0, 0));
        assert_eq!(admitted[7], (7, 7));
        assert!(!mgr.reserve_empty(0));

        // Advancing the window releases the next reserved ids in order.
        mgr.push_next_window(0, &wl, 12);
        let released = drain_ids(&wl);
        assert_eq!(released.iter().map(|&(v, _)| v).collect::<Vec<_>>(), vec![8, 9, 10, 11]);
    }

    #[test]
    fn sequential_plan_admits_everything_unbounded() {
        let plan = plan_initial((0u64..10).collect(), None, true);
        let mgr: NewWorkManager<u64> = NewWorkManager::new(1, None);
        let wl = ChunkQueue::new();
        mgr.add_initial(0, &plan, &UnboundedWindow, &wl);
        assert_eq!(drain_ids(&wl).len(), 10);
        assert!(mgr.reserve_empty(0));
    }

    #[test]
    fn distribute_assigns_position_ids_without_an_id_fn() {
        let mgr: NewWorkManager<u64> = NewWorkManager::new(1, None);
        let wm = AdaptiveWindow::new(1, 100, true);
        let wl = ChunkQueue::new();
        let barrier = Barrier::new(1);

        // Pushes arrive out of order; (parent, count) sorts them.
        mgr.push_new(52, 5, 2);
        mgr.push_new(31, 3, 1);
        mgr.push_new(51, 5, 1);
        mgr.distribute(0, &barrier, &wm, &wl);

        let got = drain_ids(&wl);
        assert_eq!(got, vec![(31, 0), (51, 1), (52, 2)]);
    }

    #[test]
    fn distribute_dedups_equal_ids_with_an_id_fn() {
        let id_fn: IdFn<u64> = Arc::new(|v| *v as usize);
        let mgr = NewWorkManager::new(1, Some(id_fn));
        let wm = AdaptiveWindow::new(1, 100, true);
        let wl = ChunkQueue::new();
        let barrier = Barrier::new(1);

        mgr.push_new(3, 1, 1);
        mgr.push_new(3, 2, 1);
        mgr.push_new(4, 2, 2);
        mgr.distribute(0, &barrier, &wm, &wl);

        let got = drain_ids(&wl);
        assert_eq!(got, vec![(3, 3), (4, 4)]);
    }

    #[test]
    fn two_workers_split_the_distribution() {
        let mgr: Arc<NewWorkManager<u64>> = Arc::new(NewWorkManager::new(2, None));
        let wm = Arc::new(AdaptiveWindow::new(2, 100, true));
        let wl = Arc::new(ChunkQueue::new());
        let barrier = Arc::new(Barrier::new(2));

        for i in 0..10 {
            mgr.push_new(i, i as usize, 1);
        }

        let mut handles = Vec::new();
        for tid in 0..2 {
            let (mgr, wm, wl, barrier) =
                (Arc::clone(&mgr), Arc::clone(&wm), Arc::clone(&wl), Arc::clone(&barrier));
            handles.push(std::thread::spawn(move || {
                mgr.distribute(tid, &barrier, &*wm, &wl);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let got = drain_ids(&wl);
        assert_eq!(got.len(), 10);
        // Position ids cover 0..10 exactly once, in merged order.
        for (pos, &(value, id)) in got.iter().enumerate() {
            assert_eq!(id, pos);
            assert_eq!(value, pos as u64);
        }
    }
}
