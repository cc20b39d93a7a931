#![forbid(unsafe_code)]
//! aqp-planner: aggregate query → DAG of execution nodes → compressed and/or
//! progressive plan.
//!
//! - `builder`: one node per aggregate sub-query in a from-list or filter
//!   position, placeholders in the parent where the sub-query was
//! - `compress`: bottom-up merge of nodes back into their sole parent
//! - `block` / `progressive`: top aggregate blocks, rewritten to run over a
//!   scrambled table one block prefix at a time
//! - `verify`: structural invariants, for tests and debug builds
//!
//! SQL text and backend calls are not made here; see `aqp-exec`.

pub mod block;
pub mod builder;
pub mod compress;
pub mod dsl;
pub mod error;
pub mod node;
pub mod plan;
pub mod progressive;
pub mod verify;

pub use block::{
    convert_to_progressive, identify_top_aggregate_blocks, AggregateBlock, BlockConversion,
    NotConvertedReason,
};
pub use compress::CompressionReport;
pub use dsl::yaml::{parse_plan_request, PlanRequest, PreparedPlan};
pub use error::{PlanError, Result};
pub use node::{ExecutionNode, NodeKind, PlaceholderFilter};
pub use plan::QueryExecutionPlan;
pub use progressive::ProgressiveSpec;
pub use verify::check_invariants;
