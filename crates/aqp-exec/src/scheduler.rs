//! Token-gated parallel execution of a plan.
//!
//! Every node gets its own task. A task waits for a completion token from
//! each dependent, then for a semaphore permit, then runs its statement(s)
//! and broadcasts its own token. Siblings run concurrently; parents always
//! run after all of their dependents.

use std::sync::Arc;

use aqp_core::connection::DbmsConnection;
use aqp_core::id::NodeId;
use aqp_core::query::TableName;
use aqp_core::sql::{SqlGenerator, Statement};
use aqp_core::types::QueryResult;
use aqp_planner::{ExecutionNode, NodeKind, QueryExecutionPlan};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;

use crate::cancel::{CancelHandle, CancelToken};
use crate::error::ExecError;
use crate::progressive::{run_progressive, ProgressUpdate};
use crate::token::{wire_queues, NodeQueues, Token, TokenStatus};

/// State shared by every node task of one run.
pub(crate) struct RunContext {
    pub connection: Arc<dyn DbmsConnection>,
    pub semaphore: Arc<Semaphore>,
    pub cancel: CancelHandle,
    pub progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    pub root: NodeId,
    created: Mutex<Vec<TableName>>,
}

impl RunContext {
    pub fn new(
        connection: Arc<dyn DbmsConnection>,
        max_parallel_nodes: usize,
        cancel: CancelHandle,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
        root: NodeId,
    ) -> Self {
        Self {
            connection,
            semaphore: Arc::new(Semaphore::new(max_parallel_nodes.max(1))),
            cancel,
            progress,
            root,
            created: Mutex::new(Vec::new()),
        }
    }

    /// Remember a scratch table before it is written, so a failed or
    /// cancelled write is still cleaned up.
    pub async fn record_scratch(&self, table: &TableName) {
        self.created.lock().await.push(table.clone());
    }

    pub async fn take_created(&self) -> Vec<TableName> {
        std::mem::take(&mut *self.created.lock().await)
    }
}

#[derive(Debug)]
pub(crate) struct NodeReport {
    pub node: NodeId,
    /// Set for the root only.
    pub result: Option<QueryResult>,
    pub progress_updates: usize,
}

#[derive(Debug)]
pub(crate) struct ScheduleOutcome {
    pub result: QueryResult,
    pub nodes_completed: usize,
    pub progress_updates: usize,
}

pub(crate) async fn schedule(
    plan: &QueryExecutionPlan,
    ctx: Arc<RunContext>,
) -> Result<ScheduleOutcome, ExecError> {
    let order = plan.topological_order()?;
    let mut queues = wire_queues(plan)?;

    let mut tasks = JoinSet::new();
    for id in order {
        let node = plan
            .node(id)
            .ok_or_else(|| ExecError::Invalid(format!("{id} missing from plan")))?
            .clone();
        let node_queues = queues.remove(&id).unwrap_or_default();
        tasks.spawn(run_node(Arc::clone(&ctx), node, node_queues));
    }

    let mut first_error: Option<ExecError> = None;
    let mut root_result = None;
    let mut nodes_completed = 0;
    let mut progress_updates = 0;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| ExecError::Task(e.to_string()))
            .and_then(|r| r);
        match outcome {
            Ok(report) => {
                nodes_completed += 1;
                progress_updates += report.progress_updates;
                if report.node == ctx.root {
                    root_result = report.result;
                }
            }
            Err(e) => {
                if first_error.is_none() && !e.is_cancelled() {
                    tracing::warn!(error = %e, "node failed; aborting plan");
                }
                ctx.cancel.abort();
                let replace = match &first_error {
                    None => true,
                    Some(prev) => prev.is_cancelled() && !e.is_cancelled(),
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }
    let result = root_result
        .ok_or_else(|| ExecError::Invalid("root finished without a result".into()))?;
    Ok(ScheduleOutcome {
        result,
        nodes_completed,
        progress_updates,
    })
}

async fn run_node(
    ctx: Arc<RunContext>,
    node: ExecutionNode,
    mut queues: NodeQueues,
) -> Result<NodeReport, ExecError> {
    let outcome = run_node_inner(&ctx, &node, &mut queues).await;
    let status = if outcome.is_ok() {
        TokenStatus::Completed
    } else {
        TokenStatus::Failed
    };
    queues.broadcast(Token {
        producer: node.id,
        status,
    });
    outcome
}

async fn run_node_inner(
    ctx: &RunContext,
    node: &ExecutionNode,
    queues: &mut NodeQueues,
) -> Result<NodeReport, ExecError> {
    let mut token = ctx.cancel.token();
    wait_for_dependents(node.id, queues, &mut token).await?;

    let _permit = tokio::select! {
        permit = Arc::clone(&ctx.semaphore).acquire_owned() => {
            permit.map_err(|e| ExecError::Task(e.to_string()))?
        }
        _ = token.aborted() => return Err(ExecError::Cancelled),
    };
    if token.is_aborted() {
        return Err(ExecError::Cancelled);
    }

    let is_root = node.id == ctx.root;
    tracing::debug!(node = %node.id, kind = node.kind.label(), is_root, "node ready");
    match &node.kind {
        NodeKind::Projection | NodeKind::Aggregate => {
            let stmt = if is_root {
                Statement::Select(node.query.clone())
            } else {
                ctx.record_scratch(&node.scratch_table).await;
                Statement::CreateTableAs {
                    table: node.scratch_table.clone(),
                    query: node.query.clone(),
                }
            };
            let result = execute(ctx, node, &stmt).await?;
            Ok(NodeReport {
                node: node.id,
                result: is_root.then_some(result),
                progress_updates: 0,
            })
        }
        NodeKind::Progressive(spec) => run_progressive(ctx, node, spec, is_root, &token).await,
    }
}

async fn wait_for_dependents(
    id: NodeId,
    queues: &mut NodeQueues,
    token: &mut CancelToken,
) -> Result<(), ExecError> {
    for listener in queues.listeners.iter_mut() {
        let mut received = 0;
        while received < listener.expected {
            let next = tokio::select! {
                t = listener.rx.recv() => t,
                _ = token.aborted() => return Err(ExecError::Cancelled),
            };
            match next {
                Some(Token {
                    producer,
                    status: TokenStatus::Completed,
                }) => {
                    tracing::trace!(node = %id, %producer, queue = listener.queue.get(), "token");
                    received += 1;
                }
                Some(Token {
                    producer,
                    status: TokenStatus::Failed,
                }) => {
                    tracing::debug!(node = %id, %producer, "dependent failed");
                    return Err(ExecError::Cancelled);
                }
                None => return Err(ExecError::Cancelled),
            }
        }
    }
    Ok(())
}

/// Render `stmt` for the connection's dialect and run it on a blocking thread.
pub(crate) async fn execute(
    ctx: &RunContext,
    node: &ExecutionNode,
    stmt: &Statement,
) -> Result<QueryResult, ExecError> {
    let sql = SqlGenerator::new(ctx.connection.syntax())
        .to_sql(stmt)
        .map_err(|source| ExecError::Sql {
            node: node.id,
            source,
        })?;
    tracing::debug!(node = %node.id, %sql, "executing statement");

    let conn = Arc::clone(&ctx.connection);
    match tokio::task::spawn_blocking(move || conn.execute(&sql)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(source)) => Err(ExecError::Node {
            node: node.id,
            scratch_table: node.scratch_table.clone(),
            source,
        }),
        Err(join) => Err(ExecError::Task(join.to_string())),
    }
}
