//! Fixed-neighborhood fast path: an explicit dependency graph.
//!
//! When the neighborhood function is stable across retries, arbitration can
//! be replaced by a graph built once per round and executed lock-free. Each
//! acquire links the acquiring context into the resource's toucher chain
//! through the owner slot (newest first); whoever linked first claims the
//! resource. After the pending barrier, each claimer collects the chains of
//! its resources, sorts every chain by `(id, address)`, and wires a
//! successor edge between consecutive distinct contexts, so all touchers of
//! one resource commit in priority order. Ties on id are broken by address;
//! either order commits. Execution drains a shared source queue of
//! predecessor-free contexts; no commit can fail in this path.

use std::sync::atomic::Ordering;

use crate::context::{CtxPtr, DetCtx, LockRef};
use crate::lockable::{ConflictHandle, Lockable};
use crate::worklist::ChunkQueue;

/// One link in a resource's toucher chain.
///
/// Nodes are heap-allocated per acquire and reclaimed by the claimer while
/// it builds the chain; the owner slot stores them reinterpreted as handle
/// pointers, which is sound because a fixed-neighborhood run never reads the
/// slot through the handle interpretation.
struct ToucherNode<V> {
    ctx: *const DetCtx<V>,
    id: usize,
    next: *mut ToucherNode<V>,
}

/// Record this context in the resource's toucher chain, claiming the
/// resource if it was unclaimed.
pub(crate) fn acquire_dag<V>(ctx: &DetCtx<V>, resource: &Lockable) {
    let node = Box::into_raw(Box::new(ToucherNode {
        ctx: ctx as *const DetCtx<V>,
        id: ctx.handle.id(),
        next: std::ptr::null_mut(),
    }));
    loop {
        let head = resource.owner();
        // SAFETY: `node` is ours until the CAS publishes it.
        unsafe { (*node).next = head as *mut ToucherNode<V> };
        if resource.replace_owner(head, node as *mut ConflictHandle) {
            if head.is_null() {
                ctx.owned.lock().unwrap().push(LockRef(resource));
            }
            return;
        }
    }
}

/// Build successor edges from the toucher chains of every resource this
/// worker's contexts claimed, releasing the owner slots as it goes.
///
/// `scratch` is reused across chains to avoid reallocating per resource.
pub(crate) fn build_chains<V>(pending: &[Box<DetCtx<V>>], scratch: &mut Vec<(usize, CtxPtr<V>)>) {
    for ctx in pending {
        let owned: Vec<LockRef> = std::mem::take(&mut *ctx.owned.lock().unwrap());
        for l in owned {
            // SAFETY: resources are user-owned and outlive the run.
            let resource = unsafe { &*l.0 };
            let mut node = resource.take_owner() as *mut ToucherNode<V>;

            scratch.clear();
            while !node.is_null() {
                // SAFETY: nodes were published by acquires this round and the
                // claimer is their unique consumer once the slot is taken.
                let owned_node = unsafe { Box::from_raw(node) };
                scratch.push((owned_node.id, CtxPtr(owned_node.ctx)));
                node = owned_node.next;
            }

            scratch.sort_by_key(|&(id, p)| (id, p.0 as usize));

            let mut last: Option<CtxPtr<V>> = None;
            for &(_, cur) in scratch.iter() {
                if let Some(prev) = last {
                    if prev == cur {
                        continue;
                    }
                    link(prev, cur);
                }
                last = Some(cur);
            }
        }
    }
}

fn link<V>(from: CtxPtr<V>, to: CtxPtr<V>) {
    // SAFETY: both contexts are alive until the commit barrier.
    unsafe {
        (*from.0).dag().succs.lock().unwrap().push(to);
        (*to.0).dag().preds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Seed the shared source queue with this worker's predecessor-free
/// contexts. Runs after the build barrier, so counters are final.
pub(crate) fn scan_sources<V>(pending: &[Box<DetCtx<V>>], sources: &ChunkQueue<CtxPtr<V>>) {
    for ctx in pending {
        if ctx.dag().preds.load(Ordering::Acquire) == 0 {
            sources.push(CtxPtr(&**ctx as *const DetCtx<V>));
        }
    }
}
