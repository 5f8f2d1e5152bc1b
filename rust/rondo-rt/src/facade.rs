//! The per-worker façade handed to user operators.
//!
//! Both operators receive a `&mut Facing<V>` alongside the item value. The
//! façade proxies resource acquisition to the active conflict context,
//! buffers pushes of new work, and scopes the per-iteration allocator and
//! the local-state slot. Acquires are recorded only on the first pass (the
//! pending phase); during commit they are no-ops, which lets the work
//! function re-run the neighborhood body without re-entering arbitration.

use std::any::Any;

use rondo_core::{EngineError, Mode, OpResult};

use crate::arena::IterationArena;
use crate::context::{acquire_ordered, DetCtx, RunKind};
use crate::dag::acquire_dag;
use crate::lockable::Lockable;
use crate::reader::{acquire_read, acquire_write};

/// The user-visible execution context for one iteration.
pub struct Facing<V> {
    push_buf: Vec<V>,
    arena: IterationArena,
    local: Option<Box<dyn Any + Send>>,
    current: *const DetCtx<V>,
    kind: RunKind,
    first_pass: bool,
    detect: bool,
    alloc_enabled: bool,
    fatal: Option<EngineError>,
}

impl<V> Facing<V> {
    pub(crate) fn new(kind: RunKind, detect: bool, alloc_enabled: bool) -> Self {
        Self {
            push_buf: Vec::new(),
            arena: IterationArena::new(),
            local: None,
            current: std::ptr::null(),
            kind,
            first_pass: true,
            detect,
            alloc_enabled,
            fatal: None,
        }
    }

    // -- user surface -----------------------------------------------------

    /// Enqueue a new item for a later round.
    pub fn push(&mut self, value: V) {
        self.push_buf.push(value);
    }

    /// Declare that this iteration uses `resource` in `mode`.
    ///
    /// Under the hood this arbitrates ownership by priority id; the result
    /// of arbitration is consulted at the commit barrier, so the call itself
    /// returns `Ok` unless the resource is unusable. Acquires outside the
    /// first pass, or with conflict detection disabled, are no-ops.
    pub fn acquire(&mut self, resource: &Lockable, mode: Mode) -> OpResult {
        if !self.detect || !self.first_pass {
            return Ok(());
        }
        if resource.is_releasable() {
            self.fatal = Some(EngineError::ReleasableResource);
            return Err(rondo_core::Signal::Conflict);
        }
        debug_assert!(!self.current.is_null(), "acquire outside an iteration");
        // SAFETY: the engine points `current` at a context that lives for
        // the whole round before invoking any operator.
        let ctx = unsafe { &*self.current };
        match self.kind {
            RunKind::Ordered => acquire_ordered(ctx, resource),
            RunKind::Reader => match mode {
                Mode::Read => acquire_read(ctx, resource),
                Mode::Write => acquire_write(ctx, resource),
            },
            RunKind::Dag => acquire_dag(ctx, resource),
        }
        Ok(())
    }

    /// Allocate scratch data that lives until the end of the iteration (or
    /// until commit, when local state is enabled).
    ///
    /// # Panics
    /// Panics when the run was not configured with per-iteration
    /// allocation.
    pub fn alloc<T>(&mut self, value: T) -> &mut T {
        assert!(
            self.alloc_enabled,
            "per-iteration allocation is not enabled for this run"
        );
        self.arena.alloc_value(value)
    }

    /// Store the hand-off state for this item's commit.
    pub fn set_local_state<T: Any + Send>(&mut self, state: T) {
        self.local = Some(Box::new(state));
    }

    /// Borrow the hand-off state, if any was stored.
    pub fn local_state<T: Any>(&self) -> Option<&T> {
        self.local.as_ref()?.downcast_ref()
    }

    /// Mutably borrow the hand-off state, if any was stored.
    pub fn local_state_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.local.as_mut()?.downcast_mut()
    }

    // -- engine surface ---------------------------------------------------

    /// Enter the pending pass of `ctx`.
    pub(crate) fn begin_pending(&mut self, ctx: *const DetCtx<V>) {
        self.current = ctx;
        self.first_pass = true;
        self.local = None;
        self.push_buf.clear();
    }

    /// Enter the commit pass of `ctx`, restoring its hand-off state.
    pub(crate) fn begin_commit(
        &mut self,
        ctx: *const DetCtx<V>,
        local: Option<Box<dyn Any + Send>>,
    ) {
        self.current = ctx;
        self.first_pass = false;
        self.local = local;
        self.push_buf.clear();
    }

    pub(crate) fn end_first_pass(&mut self) {
        self.first_pass = false;
    }

    pub(crate) fn clear_current(&mut self) {
        self.current = std::ptr::null();
    }

    pub(crate) fn take_local(&mut self) -> Option<Box<dyn Any + Send>> {
        self.local.take()
    }

    pub(crate) fn clear_local(&mut self) {
        self.local = None;
    }

    pub(crate) fn drain_push(&mut self) -> Vec<V> {
        std::mem::take(&mut self.push_buf)
    }

    pub(crate) fn push_is_empty(&self) -> bool {
        self.push_buf.is_empty()
    }

    pub(crate) fn reset_push(&mut self) {
        self.push_buf.clear();
    }

    pub(crate) fn reset_alloc(&mut self) {
        self.arena.reset();
    }

    pub(crate) fn take_fatal(&mut self) -> Option<EngineError> {
        self.fatal.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Item;

    fn facing() -> Facing<u64> {
        Facing::new(RunKind::Ordered, true, true)
    }

    #[test]
    fn pushes_buffer_until_drained() {
        let mut f = facing();
        f.push(1);
        f.push(2);
        assert!(!f.push_is_empty());
        assert_eq!(f.drain_push(), vec![1, 2]);
        assert!(f.push_is_empty());
    }

    #[test]
    fn local_state_round_trips_through_the_slot() {
        let mut f = facing();
        f.set_local_state(vec![1u32, 2, 3]);
        assert_eq!(f.local_state::<Vec<u32>>().unwrap().len(), 3);
        f.local_state_mut::<Vec<u32>>().unwrap().push(4);

        let saved = f.take_local().unwrap();
        assert!(f.local_state::<Vec<u32>>().is_none());

        let ctx: *const DetCtx<u64> = std::ptr::null();
        f.begin_commit(ctx, Some(saved));
        assert_eq!(f.local_state::<Vec<u32>>().unwrap().len(), 4);
    }

    #[test]
    fn alloc_requires_the_option() {
        let mut f: Facing<u64> = Facing::new(RunKind::Ordered, true, false);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = f.alloc(1u8);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn acquire_records_only_on_the_first_pass() {
        let ctx = DetCtx::new(Item::new(7u64, 7), RunKind::Ordered);
        let resource = Lockable::new();
        let mut f = facing();

        f.begin_pending(&*ctx as *const DetCtx<u64>);
        f.acquire(&resource, Mode::Write).unwrap();
        assert!(!resource.owner().is_null());
        ctx.release_owned();

        // Commit pass: no arbitration.
        f.begin_commit(&*ctx as *const DetCtx<u64>, None);
        f.acquire(&resource, Mode::Write).unwrap();
        assert!(resource.owner().is_null());
    }

    #[test]
    fn disabled_detection_ignores_acquires() {
        let mut f: Facing<u64> = Facing::new(RunKind::Ordered, false, false);
        let resource = Lockable::new();
        // No active context is required when detection is off.
        f.acquire(&resource, Mode::Write).unwrap();
        assert!(resource.owner().is_null());
    }

    #[test]
    fn releasable_resources_are_rejected_fatally() {
        let ctx = DetCtx::new(Item::new(1u64, 1), RunKind::Ordered);
        let resource = Lockable::new_releasable();
        let mut f = facing();

        f.begin_pending(&*ctx as *const DetCtx<u64>);
        assert!(f.acquire(&resource, Mode::Write).is_err());
        assert!(matches!(
            f.take_fatal(),
            Some(EngineError::ReleasableResource)
        ));
    }
}
