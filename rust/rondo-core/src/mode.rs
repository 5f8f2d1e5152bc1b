//! Acquire modes.

use std::fmt;

/// How an operator intends to use a resource it acquires.
///
/// Under ordinary conflict detection the mode is ignored: every acquire is
/// arbitrated exclusively. When the executor runs with intent-to-read
/// enabled, `Read` acquires of the same resource form a shared reader group
/// and commit together; a `Write` acquire competes with every holder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Shared access; the resource is not mutated by this iteration.
    Read,
    /// Exclusive access.
    Write,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Read => f.write_str("read"),
            Mode::Write => f.write_str("write"),
        }
    }
}
