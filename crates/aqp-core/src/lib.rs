#![forbid(unsafe_code)]
//! aqp-core: shared vocabulary for the approximate-query planner.
//!
//! - strongly-typed ids (`NodeId`, `QueueId`)
//! - the logical query object model the planner rewrites
//! - scramble metadata (`ScrambleCatalog`)
//! - the SQL-generation and connection interfaces the planner hands work to
//! - configuration, hashing, and run manifests
//!
//! No async or I/O here; the exec crate owns scheduling and backend calls.

pub mod config;
pub mod connection;
pub mod error;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod prelude;
pub mod query;
pub mod scramble;
pub mod sql;
pub mod types;

pub use error::{Error, Result};

/// Crate version, stamped into run manifests.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
