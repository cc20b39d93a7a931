#![forbid(unsafe_code)]
//! aqp-exec: runs execution plans against a backend connection.
//!
//! One tokio task per node, gated by completion tokens from its dependents
//! and bounded by a semaphore. Progressive nodes report an estimate after
//! every block prefix. Scratch tables are dropped when the run ends.

pub mod cancel;
pub mod error;
pub mod progressive;
pub mod runtime;
pub mod scheduler;
pub mod token;

pub use cancel::{CancelHandle, CancelLevel, CancelToken};
pub use error::ExecError;
pub use progressive::ProgressUpdate;
pub use runtime::{Engine, PlanOutcome};
