//! Rondo Core
//!
//! Shared vocabulary used across the rondo crates: the acquire modes users
//! declare on resources, the signals operators return, the error taxonomy,
//! and the run report the executor hands back.

pub mod error;
pub mod mode;
pub mod report;

pub use error::{EngineError, OpResult, Signal};
pub use mode::Mode;
pub use report::Report;
