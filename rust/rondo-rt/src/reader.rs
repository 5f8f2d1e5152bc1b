//! Intent-to-read: shared reader groups over a single resource.
//!
//! An item in an intent-to-read run carries two identities: its write
//! identity (the context handle) and a reader identity. Reader identities of
//! items that declared `Read` on the same resource are merged into one
//! union-find group; the whole group commits together or is disabled
//! together. Between the pending and commit barriers two sweeps run over
//! every context: `build` collapses each group to its root and moves
//! not-readiness there, and `propagate` disables every write identity whose
//! group root ended up disabled.
//!
//! Union direction is fixed by `(id, address)` order, lower becoming the
//! root, so no parent cycles can form. `find` path-compresses with plain
//! stores; a compressed link always points at an ancestor, which keeps
//! concurrent walks correct.

use crate::context::{CtxExtra, DetCtx, LockRef};
use crate::lockable::{ConflictHandle, Lockable};

/// Total order used to pick union winners.
fn rank(h: *const ConflictHandle) -> (usize, usize) {
    // SAFETY: callers only rank handles alive this round.
    (unsafe { (*h).id() }, h as usize)
}

/// Find the root of `h`'s group, compressing the path walked.
pub(crate) fn find(h: *const ConflictHandle) -> *const ConflictHandle {
    // SAFETY: handles on a parent path stay alive for the round; links are
    // never removed, only added toward roots.
    unsafe {
        let mut root = h;
        loop {
            let p = (*root).parent();
            if p.is_null() {
                break;
            }
            root = p;
        }
        let mut cur = h;
        while cur != root {
            let p = (*cur).parent();
            if p.is_null() {
                break;
            }
            (*cur).compress_parent(root as *mut ConflictHandle);
            cur = p;
        }
        root
    }
}

/// Merge the groups of `a` and `b`.
pub(crate) fn union(a: *const ConflictHandle, b: *const ConflictHandle) {
    loop {
        let ra = find(a);
        let rb = find(b);
        if ra == rb {
            return;
        }
        let (winner, loser) = if rank(ra) < rank(rb) {
            (ra, rb)
        } else {
            (rb, ra)
        };
        // SAFETY: both roots are live handles; a failed CAS means another
        // union linked this root first and we retry from the new roots.
        if unsafe { (*loser).try_set_parent(winner as *mut ConflictHandle) } {
            return;
        }
    }
}

/// `Read`-mode acquire: share with readers, arbitrate with writers.
pub(crate) fn acquire_read<V>(ctx: &DetCtx<V>, resource: &Lockable) {
    let me = &ctx.handle as *const ConflictHandle;
    let reader = ctx.reader_handle() as *const ConflictHandle;

    loop {
        let other = resource.owner();
        if std::ptr::eq(other, me) || std::ptr::eq(other, reader) {
            return;
        }
        if !other.is_null() {
            // SAFETY: live handle for this round.
            let holder = unsafe { &*other };
            if holder.id() < ctx.handle.id() {
                if holder.is_writer() {
                    // A higher-priority writer holds it; the group loses.
                    unsafe { (*reader).mark_not_ready() };
                } else {
                    union(other, reader);
                }
                return;
            }
        }
        if resource.replace_owner(other, reader as *mut ConflictHandle) {
            if other.is_null() {
                ctx.owned.lock().unwrap().push(LockRef(resource));
            } else {
                let holder = unsafe { &*other };
                if holder.is_writer() {
                    holder.mark_not_ready();
                } else {
                    union(other, reader);
                }
            }
            return;
        }
    }
}

/// `Write`-mode acquire: the ordered rules, against any holder.
pub(crate) fn acquire_write<V>(ctx: &DetCtx<V>, resource: &Lockable) {
    let me = &ctx.handle as *const ConflictHandle;
    let reader = ctx.reader_handle() as *const ConflictHandle;

    loop {
        let other = resource.owner();
        if std::ptr::eq(other, me) || std::ptr::eq(other, reader) {
            return;
        }
        if !other.is_null() {
            // SAFETY: live handle for this round.
            let holder = unsafe { &*other };
            if holder.id() < ctx.handle.id() {
                ctx.handle.mark_not_ready();
                return;
            }
        }
        if resource.replace_owner(other, me as *mut ConflictHandle) {
            if other.is_null() {
                ctx.owned.lock().unwrap().push(LockRef(resource));
            } else {
                unsafe { (*other).mark_not_ready() };
            }
            return;
        }
    }
}

/// First sweep: push each disabled reader identity's flag to its group root.
pub(crate) fn build_sweep<V>(pending: &[Box<DetCtx<V>>]) {
    for ctx in pending {
        if let CtxExtra::Reader(reader) = &ctx.extra {
            if !reader.is_ready() {
                let root = find(reader as *const ConflictHandle);
                // SAFETY: group roots are live handles.
                unsafe { (*root).mark_not_ready() };
            }
        }
    }
}

/// Second sweep: a disabled group disables every member's write identity.
pub(crate) fn propagate_sweep<V>(pending: &[Box<DetCtx<V>>]) {
    for ctx in pending {
        if let CtxExtra::Reader(reader) = &ctx.extra {
            if ctx.handle.is_ready() {
                let root = find(reader as *const ConflictHandle);
                // SAFETY: group roots are live handles.
                if !unsafe { (*root).is_ready() } {
                    ctx.handle.mark_not_ready();
                }
            }
        }
    }
}
