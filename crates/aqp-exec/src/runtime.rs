//! Runtime: run a prepared plan against a backend connection, drop its
//! scratch tables, and emit a `RunManifest`.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use aqp_core::config::AqpConfig;
use aqp_core::connection::DbmsConnection;
use aqp_core::hash::hash_serde;
use aqp_core::manifest::RunManifest;
use aqp_core::query::SelectQuery;
use aqp_core::scramble::ScrambleCatalog;
use aqp_core::sql::{SqlGenerator, Statement};
use aqp_core::types::QueryResult;
use aqp_planner::{check_invariants, QueryExecutionPlan};
use tokio::sync::mpsc;

use crate::cancel::CancelHandle;
use crate::error::ExecError;
use crate::progressive::ProgressUpdate;
use crate::scheduler::{schedule, RunContext};

/// Root result plus the run's manifest.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub result: QueryResult,
    pub manifest: RunManifest,
}

/// Engine owns the configuration and the backend connection.
pub struct Engine {
    config: AqpConfig,
    connection: Arc<dyn DbmsConnection>,
}

impl Engine {
    pub fn new(config: AqpConfig, connection: Arc<dyn DbmsConnection>) -> Self {
        Self { config, connection }
    }

    pub fn config(&self) -> &AqpConfig {
        &self.config
    }

    /// Build a plan for `query`, then compress and convert it as configured.
    pub fn prepare(
        &self,
        query: &SelectQuery,
        catalog: Arc<ScrambleCatalog>,
    ) -> Result<QueryExecutionPlan, ExecError> {
        self.config.validate()?;
        let mut plan =
            QueryExecutionPlan::from_query(self.config.scratch_schema.clone(), query, catalog)?;
        if self.config.compress {
            plan.compress();
        }
        if self.config.progressive {
            plan.make_progressive_if_available()?;
        }
        Ok(plan)
    }

    /// Prepare and run `query` to completion.
    pub async fn run_query(
        &self,
        query: &SelectQuery,
        catalog: Arc<ScrambleCatalog>,
    ) -> Result<PlanOutcome, ExecError> {
        let plan = self.prepare(query, catalog)?;
        self.run(&plan, &CancelHandle::new(), None).await
    }

    /// Execute `plan`. Progressive increments are sent to `progress` as they
    /// complete. Scratch tables are dropped before returning, on success,
    /// failure and cancellation alike (unless cleanup is disabled).
    pub async fn run(
        &self,
        plan: &QueryExecutionPlan,
        cancel: &CancelHandle,
        progress: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    ) -> Result<PlanOutcome, ExecError> {
        self.config.validate()?;
        check_invariants(plan)?;
        let root = plan
            .root()
            .ok_or_else(|| ExecError::Invalid("plan has not been built".into()))?;

        let started = now_millis();
        let plan_hash = plan.fingerprint()?;
        let query_hash = match plan.source_query() {
            Some(q) => hash_serde(q)?,
            None => plan_hash,
        };
        let mut manifest = RunManifest::new(query_hash, plan_hash, plan.instance_tag(), started);
        manifest.nodes_scheduled = plan.len();
        manifest.progressive_nodes = plan.progressive_nodes().len();

        tracing::info!(
            tag = plan.instance_tag(),
            nodes = plan.len(),
            progressive = manifest.progressive_nodes,
            plan = %plan_hash.short(),
            "running plan"
        );

        let ctx = Arc::new(RunContext::new(
            Arc::clone(&self.connection),
            self.config.max_parallel_nodes,
            cancel.clone(),
            progress,
            root,
        ));
        let outcome = schedule(plan, Arc::clone(&ctx)).await;

        let created = ctx.take_created().await;
        let dropped = if self.config.cleanup_scratch {
            self.drop_scratch_tables(&created).await
        } else {
            0
        };

        let outcome = outcome?;
        manifest.nodes_completed = outcome.nodes_completed;
        manifest.progress_updates = outcome.progress_updates;
        manifest.scratch_tables_dropped = dropped;
        let manifest = manifest.finish(now_millis());
        tracing::info!(
            tag = plan.instance_tag(),
            elapsed_ms = manifest.elapsed_ms(),
            rows = outcome.result.num_rows(),
            "plan finished"
        );
        Ok(PlanOutcome {
            result: outcome.result,
            manifest,
        })
    }

    /// `DROP TABLE IF EXISTS` every table; failures are logged, not returned.
    async fn drop_scratch_tables(&self, tables: &[aqp_core::query::TableName]) -> usize {
        let mut dropped = 0;
        for table in tables {
            let stmt = Statement::DropTable {
                table: table.clone(),
                if_exists: true,
            };
            let sql = match SqlGenerator::new(self.connection.syntax()).to_sql(&stmt) {
                Ok(sql) => sql,
                Err(e) => {
                    tracing::warn!(%table, error = %e, "cannot render scratch drop");
                    continue;
                }
            };
            let conn = Arc::clone(&self.connection);
            match tokio::task::spawn_blocking(move || conn.execute(&sql)).await {
                Ok(Ok(_)) => {
                    tracing::debug!(%table, "dropped scratch table");
                    dropped += 1;
                }
                Ok(Err(e)) => tracing::warn!(%table, error = %e, "failed to drop scratch table"),
                Err(e) => tracing::warn!(%table, error = %e, "scratch drop task failed"),
            }
        }
        dropped
    }
}

// --- helpers ---

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
