use aqp_core::connection::ConnectionError;
use aqp_core::id::NodeId;
use aqp_core::query::TableName;
use aqp_planner::PlanError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("{node} failed (scratch table {scratch_table}): {source}")]
    Node {
        node: NodeId,
        scratch_table: TableName,
        #[source]
        source: ConnectionError,
    },

    #[error("cannot render SQL for {node}: {source}")]
    Sql {
        node: NodeId,
        #[source]
        source: aqp_core::Error,
    },

    #[error("plan cancelled")]
    Cancelled,

    #[error("planning: {0}")]
    Plan(#[from] PlanError),

    #[error("invalid plan: {0}")]
    Invalid(String),

    #[error("node task: {0}")]
    Task(String),

    #[error(transparent)]
    Core(#[from] aqp_core::Error),
}

impl ExecError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExecError::Cancelled)
    }
}
