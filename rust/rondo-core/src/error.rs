//! Error taxonomy for the executor.
//!
//! Two kinds of "failure" flow through a run and they are deliberately kept
//! apart. A [`Signal`] is operator-level control flow: a conflict is expected,
//! recovered by rescheduling the iteration, and never surfaces to the caller.
//! An [`EngineError`] ends the run: the executor neither logs nor retries it.

use thiserror::Error;

/// Out-of-band signal an operator may return to the executor.
///
/// Returning `Err(Signal::Conflict)` from a neighborhood or work function
/// marks the current iteration as retryable; the item keeps its priority id
/// and re-enters the next round. There is no other recoverable signal: any
/// failure an operator cannot express as a conflict must surface through a
/// panic-free channel of its own (typically by recording state and committing
/// a tombstone value).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The iteration observed a conflict and must be re-executed.
    Conflict,
}

/// Result type returned by user operators.
pub type OpResult = Result<(), Signal>;

/// Fatal, non-recoverable errors.
///
/// Conflicts stay inside the round; everything here ends the run with `Err`.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The option bag is inconsistent (for example a fixed neighborhood
    /// without an id function).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// An operator acquired a resource tagged as releasable. Releasable
    /// resources cannot participate in priority arbitration and are
    /// rejected on detection.
    #[error("acquire of a releasable resource is not supported")]
    ReleasableResource,

    /// A single committed iteration pushed more new items than the
    /// per-parent counter can number.
    #[error("push counter overflow for parent id {parent}")]
    CounterOverflow {
        /// Priority id of the committing item whose pushes overflowed.
        parent: usize,
    },

    /// An operator failed in a way that is neither success nor conflict.
    #[error("operator failure: {0}")]
    Operator(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_is_not_an_engine_error() {
        let r: OpResult = Err(Signal::Conflict);
        assert_eq!(r.unwrap_err(), Signal::Conflict);
    }

    #[test]
    fn errors_render_a_message() {
        let e = EngineError::Config("fixed neighborhood requires an id function".into());
        assert!(e.to_string().contains("invalid configuration"));

        let e = EngineError::CounterOverflow { parent: 7 };
        assert!(e.to_string().contains("parent id 7"));

        let e = EngineError::ReleasableResource;
        assert!(e.to_string().contains("releasable"));
    }
}
