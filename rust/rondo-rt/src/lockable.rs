//! Resource handles and the conflict-arbitration header.
//!
//! A [`Lockable`] is the unit of conflict detection: user code embeds one in
//! every domain object that iterations may contend on and declares it to the
//! façade with `acquire`. The engine never creates resources; it only
//! arbitrates the single owner slot each one carries.
//!
//! The owner slot holds a pointer to a [`ConflictHandle`], the small header
//! every per-item context exposes. Ownership transfers exclusively through
//! compare-and-swap; reads may be relaxed but the swap that transfers
//! ownership is release and the pairing load acquire, so a context that
//! observes an owner also observes that owner's id.
//!
//! # Pointer lifetime
//!
//! Handles are valid from context creation in the pending phase until the
//! commit barrier of the same round. Every claimed slot is cleared by its
//! claiming context before that barrier, so no slot ever outlives the header
//! it points to. The dependency-graph fast path reinterprets the slot as the
//! head of a per-resource chain of toucher nodes; that mode never mixes with
//! the handle interpretation within a run.

use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

/// Header through which contexts participate in conflict arbitration.
pub(crate) struct ConflictHandle {
    id: usize,
    writer: bool,
    not_ready: AtomicBool,
    /// Reader identities use this as their union-find parent (null = root).
    parent: AtomicPtr<ConflictHandle>,
}

impl ConflictHandle {
    pub(crate) fn new(id: usize, writer: bool) -> Self {
        Self {
            id,
            writer,
            not_ready: AtomicBool::new(false),
            parent: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    pub(crate) fn is_writer(&self) -> bool {
        self.writer
    }

    pub(crate) fn is_ready(&self) -> bool {
        !self.not_ready.load(Ordering::Relaxed)
    }

    /// Disable this identity. Every writer stores the same value and the
    /// flag is only consulted after the phase barrier, so relaxed ordering
    /// suffices.
    pub(crate) fn mark_not_ready(&self) {
        self.not_ready.store(true, Ordering::Relaxed);
    }

    pub(crate) fn parent(&self) -> *mut ConflictHandle {
        self.parent.load(Ordering::Acquire)
    }

    /// Attach this root under `parent`. Fails if another union got here
    /// first.
    pub(crate) fn try_set_parent(&self, parent: *mut ConflictHandle) -> bool {
        self.parent
            .compare_exchange(
                ptr::null_mut(),
                parent,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Path-compression store; `ancestor` must already be on this node's
    /// root path.
    pub(crate) fn compress_parent(&self, ancestor: *mut ConflictHandle) {
        self.parent.store(ancestor, Ordering::Release);
    }
}

/// A conflict-detection handle for one shared resource.
///
/// `Lockable` is intended to be embedded in user data:
///
/// ```
/// use rondo_rt::Lockable;
///
/// struct Node {
///     weight: u64,
///     lock: Lockable,
/// }
///
/// let n = Node { weight: 3, lock: Lockable::new() };
/// assert!(!n.lock.is_releasable());
/// assert_eq!(n.weight, 3);
/// ```
pub struct Lockable {
    owner: AtomicPtr<ConflictHandle>,
    releasable: bool,
}

impl Lockable {
    /// Create a resource handle.
    pub fn new() -> Self {
        Self {
            owner: AtomicPtr::new(ptr::null_mut()),
            releasable: false,
        }
    }

    /// Create a handle tagged as releasable mid-iteration.
    ///
    /// Such resources cannot participate in priority arbitration; acquiring
    /// one is a fatal error. The constructor exists so callers porting from
    /// lock-based code get a loud failure instead of silent misbehavior.
    pub fn new_releasable() -> Self {
        Self {
            owner: AtomicPtr::new(ptr::null_mut()),
            releasable: true,
        }
    }

    /// Whether this resource was tagged releasable.
    pub fn is_releasable(&self) -> bool {
        self.releasable
    }

    pub(crate) fn owner(&self) -> *mut ConflictHandle {
        self.owner.load(Ordering::Acquire)
    }

    /// Claim an unowned resource. The caller becomes responsible for
    /// clearing the slot at the end of the round.
    pub(crate) fn try_claim(&self, me: *mut ConflictHandle) -> bool {
        self.owner
            .compare_exchange(ptr::null_mut(), me, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transfer ownership from `old` to `new`.
    pub(crate) fn replace_owner(
        &self,
        old: *mut ConflictHandle,
        new: *mut ConflictHandle,
    ) -> bool {
        self.owner
            .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Clear the slot. Called by the claiming context at commit or cancel.
    pub(crate) fn release(&self) {
        self.owner.store(ptr::null_mut(), Ordering::Release);
    }

    /// Take the slot contents, leaving it clear.
    pub(crate) fn take_owner(&self) -> *mut ConflictHandle {
        self.owner.swap(ptr::null_mut(), Ordering::AcqRel)
    }
}

impl Default for Lockable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lockable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lockable")
            .field("owned", &!self.owner.load(Ordering::Relaxed).is_null())
            .field("releasable", &self.releasable)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_succeeds_once() {
        let lock = Lockable::new();
        let a = ConflictHandle::new(1, true);
        let b = ConflictHandle::new(2, true);
        let pa = &a as *const _ as *mut ConflictHandle;
        let pb = &b as *const _ as *mut ConflictHandle;

        assert!(lock.try_claim(pa));
        assert!(!lock.try_claim(pb));
        assert_eq!(lock.owner(), pa);
    }

    #[test]
    fn replace_owner_requires_expected_value() {
        let lock = Lockable::new();
        let a = ConflictHandle::new(1, true);
        let b = ConflictHandle::new(2, true);
        let pa = &a as *const _ as *mut ConflictHandle;
        let pb = &b as *const _ as *mut ConflictHandle;

        assert!(lock.try_claim(pa));
        assert!(!lock.replace_owner(pb, pb));
        assert!(lock.replace_owner(pa, pb));
        assert_eq!(lock.owner(), pb);
    }

    #[test]
    fn release_clears_the_slot() {
        let lock = Lockable::new();
        let a = ConflictHandle::new(1, true);
        let pa = &a as *const _ as *mut ConflictHandle;

        assert!(lock.try_claim(pa));
        lock.release();
        assert!(lock.owner().is_null());
        assert!(lock.try_claim(pa));
        assert_eq!(lock.take_owner(), pa);
        assert!(lock.owner().is_null());
    }

    #[test]
    fn not_ready_flag_is_sticky() {
        let h = ConflictHandle::new(5, true);
        assert!(h.is_ready());
        h.mark_not_ready();
        h.mark_not_ready();
        assert!(!h.is_ready());
    }

    #[test]
    fn parent_link_is_set_once() {
        let a = ConflictHandle::new(1, false);
        let b = ConflictHandle::new(2, false);
        let c = ConflictHandle::new(3, false);
        let pa = &a as *const _ as *mut ConflictHandle;
        let pc = &c as *const _ as *mut ConflictHandle;

        assert!(b.try_set_parent(pa));
        assert!(!b.try_set_parent(pc));
        assert_eq!(b.parent(), pa);
    }

    #[test]
    fn releasable_tag_round_trips() {
        assert!(!Lockable::new().is_releasable());
        assert!(Lockable::new_releasable().is_releasable());
    }
}
