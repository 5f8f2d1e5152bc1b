//! Per-item conflict-detection contexts.
//!
//! Every item that enters the pending phase is wrapped in a fresh context.
//! The context records the resources the neighborhood function acquires,
//! carries the outcome of priority arbitration in its [`ConflictHandle`],
//! and is destroyed before the next round's pending phase. Contexts are
//! boxed into per-worker pending lists; all cross-thread references travel
//! as raw pointers that the round structure keeps alive (see the lifetime
//! notes in [`crate::lockable`]).

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::lockable::{ConflictHandle, Lockable};

/// A prioritized unit of work.
///
/// `id` is the priority; lower wins. The local-state slot hands data written
/// during the pending phase to the commit phase of the same item.
pub(crate) struct Item<V> {
    pub value: V,
    pub id: usize,
    pub local: Mutex<Option<Box<dyn Any + Send>>>,
}

impl<V> Item<V> {
    pub(crate) fn new(value: V, id: usize) -> Self {
        Self {
            value,
            id,
            local: Mutex::new(None),
        }
    }
}

/// Which conflict-context variant a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RunKind {
    /// Priority arbitration with steals; the default.
    Ordered,
    /// Ordered arbitration plus shared reader groups.
    Reader,
    /// Fixed-neighborhood dependency graph.
    Dag,
}

/// A `Send + Sync` wrapper for a resource pointer held in an owned list.
#[derive(Clone, Copy)]
pub(crate) struct LockRef(pub *const Lockable);

// SAFETY: the pointee is owned by user code that outlives the run, and all
// engine-side access is through atomics.
unsafe impl Send for LockRef {}
unsafe impl Sync for LockRef {}

/// A `Send + Sync` context pointer, valid for the current round only.
pub(crate) struct CtxPtr<V>(pub *const DetCtx<V>);

impl<V> Clone for CtxPtr<V> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<V> Copy for CtxPtr<V> {}
impl<V> PartialEq for CtxPtr<V> {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.0, other.0)
    }
}
impl<V> Eq for CtxPtr<V> {}

// SAFETY: contexts live until the commit barrier of the round and all
// mutable state behind the pointer is atomic or mutex-guarded.
unsafe impl<V> Send for CtxPtr<V> {}
unsafe impl<V> Sync for CtxPtr<V> {}

/// Dependency-graph bookkeeping for the fixed-neighborhood variant.
pub(crate) struct DagPart<V> {
    /// Predecessors not yet committed.
    pub preds: AtomicUsize,
    /// Successor contexts, populated while the graph is built.
    pub succs: Mutex<Vec<CtxPtr<V>>>,
}

impl<V> Default for DagPart<V> {
    fn default() -> Self {
        Self {
            preds: AtomicUsize::new(0),
            succs: Mutex::new(Vec::new()),
        }
    }
}

/// Variant-specific context payload.
pub(crate) enum CtxExtra<V> {
    Ordered,
    /// The reader-group identity for intent-to-read runs.
    Reader(ConflictHandle),
    Dag(DagPart<V>),
}

/// The per-item conflict-detection record.
pub(crate) struct DetCtx<V> {
    pub item: Item<V>,
    /// Write identity of this item.
    pub handle: ConflictHandle,
    pub first_pass: AtomicBool,
    /// Resources whose owner slot this context claimed and must clear.
    pub owned: Mutex<Vec<LockRef>>,
    pub extra: CtxExtra<V>,
}

impl<V> DetCtx<V> {
    pub(crate) fn new(item: Item<V>, kind: RunKind) -> Box<Self> {
        let id = item.id;
        let extra = match kind {
            RunKind::Ordered => CtxExtra::Ordered,
            RunKind::Reader => CtxExtra::Reader(ConflictHandle::new(id, false)),
            RunKind::Dag => CtxExtra::Dag(DagPart::default()),
        };
        Box::new(Self {
            item,
            handle: ConflictHandle::new(id, true),
            first_pass: AtomicBool::new(true),
            owned: Mutex::new(Vec::new()),
            extra,
        })
    }

    pub(crate) fn is_ready(&self) -> bool {
        self.handle.is_ready()
    }

    pub(crate) fn reader_handle(&self) -> &ConflictHandle {
        match &self.extra {
            CtxExtra::Reader(h) => h,
            _ => unreachable!("reader identity requested outside an intent-to-read run"),
        }
    }

    pub(crate) fn dag(&self) -> &DagPart<V> {
        match &self.extra {
            CtxExtra::Dag(d) => d,
            _ => unreachable!("dependency-graph state requested outside a fixed-neighborhood run"),
        }
    }

    /// Clear the owner slot of every resource this context claimed.
    pub(crate) fn release_owned(&self) {
        let mut owned = self.owned.lock().unwrap();
        for l in owned.drain(..) {
            // SAFETY: the resource outlives the run (user-owned).
            unsafe { (*l.0).release() };
        }
    }

    pub(crate) fn set_first_pass(&self, value: bool) {
        self.first_pass.store(value, Ordering::Relaxed);
    }
}

/// The ordered acquire protocol.
///
/// 1. Claim an unowned resource outright; the claimer releases it at the
///    end of the round.
/// 2. A resource we already own needs nothing further.
/// 3. Losing to a lower id disables this context.
/// 4. A higher-id holder is stolen from by CAS; the loser is disabled.
pub(crate) fn acquire_ordered<V>(ctx: &DetCtx<V>, resource: &Lockable) {
    let me = &ctx.handle as *const ConflictHandle as *mut ConflictHandle;

    if resource.try_claim(me) {
        ctx.owned.lock().unwrap().push(LockRef(resource));
        return;
    }

    loop {
        let other = resource.owner();
        if other == me {
            return;
        }
        if other.is_null() {
            // Slots only empty out between rounds; retry the claim.
            if resource.try_claim(me) {
                ctx.owned.lock().unwrap().push(LockRef(resource));
                return;
            }
            continue;
        }
        // SAFETY: a non-null owner is a handle of a context alive this round.
        let holder = unsafe { &*other };
        if holder.id() < ctx.handle.id() {
            ctx.handle.mark_not_ready();
            return;
        }
        if resource.replace_owner(other, me) {
            holder.mark_not_ready();
            return;
        }
    }
}
