//! Rondo Runtime
//!
//! A deterministic parallel executor for irregular, speculative iterative
//! computations. A run takes an initial workset, a *neighborhood function*
//! `fn1` that declares which resources each item touches, and a *work
//! function* `fn2` that performs the item's effect; the engine executes them
//! across worker threads while guaranteeing the externally observable
//! effect is identical to a fixed serial schedule of the same input,
//! independent of thread count, scheduling, or timing.
//!
//! Execution is round-structured. In every round a pending phase speculates
//! over a window of the highest-priority items and records the resources
//! they acquire; conflicting acquires are arbitrated by priority id (lower
//! wins). The commit phase then runs the work function on the winners and
//! reschedules the losers. Items pushed by committed work are sorted and
//! renumbered deterministically between rounds.
//!
//! ```
//! use std::sync::Mutex;
//! use rondo_rt::{Builder, Lockable, Mode};
//!
//! // Three items contend on one resource; they commit in id order, one
//! // round apiece, regardless of the worker count.
//! let resource = Lockable::new();
//! let log = Mutex::new(Vec::new());
//!
//! let report = Builder::new(
//!     |_v: &u64, facing| facing.acquire(&resource, Mode::Write),
//!     |v, _facing| {
//!         log.lock().unwrap().push(*v);
//!         Ok(())
//!     },
//! )
//! .workers(4)
//! .id_fn(|v| *v as usize)
//! .run(vec![2u64, 3, 1])
//! .unwrap();
//!
//! assert_eq!(log.into_inner().unwrap(), vec![1, 2, 3]);
//! assert_eq!(report.total_committed(), 3);
//! ```

pub mod arena;
mod context;
mod dag;
mod engine;
mod facade;
mod lockable;
mod newwork;
mod reader;
mod stats;
mod window;
mod worklist;

pub use engine::Builder;
pub use facade::Facing;
pub use lockable::Lockable;
pub use stats::{StatSink, TracingSink};

pub use rondo_core::{EngineError, Mode, OpResult, Report, Signal};
