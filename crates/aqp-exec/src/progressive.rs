//! Progressive execution: one SELECT per block prefix, one update per
//! increment, and the last increment kept as the node's answer.

use aqp_core::id::NodeId;
use aqp_core::sql::Statement;
use aqp_core::types::QueryResult;
use aqp_planner::{ExecutionNode, ProgressiveSpec};
use serde::{Deserialize, Serialize};

use crate::cancel::CancelToken;
use crate::error::ExecError;
use crate::scheduler::{execute, NodeReport, RunContext};

/// Estimate after `blocks_processed` of `total_blocks` blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub node: NodeId,
    pub blocks_processed: u32,
    pub total_blocks: u32,
    pub result: QueryResult,
}

impl ProgressUpdate {
    pub fn is_final(&self) -> bool {
        self.blocks_processed == self.total_blocks
    }

    pub fn fraction(&self) -> f64 {
        f64::from(self.blocks_processed) / f64::from(self.total_blocks.max(1))
    }
}

pub(crate) async fn run_progressive(
    ctx: &RunContext,
    node: &ExecutionNode,
    spec: &ProgressiveSpec,
    is_root: bool,
    token: &CancelToken,
) -> Result<NodeReport, ExecError> {
    let total = spec.total_blocks();
    let mut last = None;
    let mut updates = 0;

    for k in 1..=total {
        if token.is_aborted() {
            return Err(ExecError::Cancelled);
        }
        if k > 1 && token.should_stop_progressive() {
            tracing::info!(node = %node.id, blocks = k - 1, total, "stopping progressive node early");
            break;
        }
        let query = spec.increment_query(&node.query, k)?;
        let result = execute(ctx, node, &Statement::Select(query.clone())).await?;

        if let Some(tx) = &ctx.progress {
            let update = ProgressUpdate {
                node: node.id,
                blocks_processed: k,
                total_blocks: total,
                result: result.clone(),
            };
            if tx.send(update).is_err() {
                tracing::trace!(node = %node.id, "progress receiver dropped");
            }
        }
        updates += 1;
        last = Some((query, result));
    }

    let (query, result) =
        last.ok_or_else(|| ExecError::Invalid(format!("{} has no blocks", node.id)))?;
    if !is_root {
        ctx.record_scratch(&node.scratch_table).await;
        let stmt = Statement::CreateTableAs {
            table: node.scratch_table.clone(),
            query,
        };
        execute(ctx, node, &stmt).await?;
    }
    Ok(NodeReport {
        node: node.id,
        result: is_root.then_some(result),
        progress_updates: updates,
    })
}
