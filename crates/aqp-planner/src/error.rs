use aqp_core::id::NodeId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PlanError>;

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("query has no aggregate function and no GROUP BY at any level")]
    NotAggregate,

    #[error("aggregate sub-query in {clause} is not supported")]
    UnsupportedPosition { clause: &'static str },

    #[error("reference to '{alias}' is not bound by any enclosing scope")]
    CorrelationUnsupported { alias: String },

    #[error("placeholder for {node} not found in the query of {parent}")]
    CompressionInvariantViolation { node: NodeId, parent: NodeId },

    #[error("unknown node {0}")]
    UnknownNode(NodeId),

    #[error("plan already built (root {0})")]
    AlreadyBuilt(NodeId),

    #[error("invalid plan: {0}")]
    Invariant(String),

    #[error(transparent)]
    Core(#[from] aqp_core::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_pass_through() {
        let err: PlanError = aqp_core::Error::Config("max_parallel_nodes must be > 0".into()).into();
        assert!(matches!(err, PlanError::Core(aqp_core::Error::Config(_))));
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_parallel_nodes must be > 0"
        );
    }
}
