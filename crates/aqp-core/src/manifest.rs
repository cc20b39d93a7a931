//! Run manifest returned by every engine run.
//!
//! Records which plan ran (by fingerprint), how many nodes it had before and
//! after rewriting, and what the run left behind in the scratch schema.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: ManifestId,

    /// Fingerprint of the user query the plan was built from.
    pub query_hash: Hash256,

    /// Fingerprint of the plan as handed to the scheduler.
    pub plan_hash: Hash256,

    /// Instance tag of the plan's identifier namespace.
    pub instance_tag: String,

    pub engine_version: String,

    pub nodes_scheduled: usize,
    pub progressive_nodes: usize,

    /// Nodes that ran to completion (the root included).
    pub nodes_completed: usize,

    /// Progressive increments reported to the caller.
    pub progress_updates: usize,

    /// Scratch tables dropped during teardown.
    pub scratch_tables_dropped: usize,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunManifest {
    pub fn new(
        query_hash: Hash256,
        plan_hash: Hash256,
        instance_tag: impl Into<String>,
        started_ms: u64,
    ) -> Self {
        Self {
            id: ManifestId(Uuid::new_v4()),
            query_hash,
            plan_hash,
            instance_tag: instance_tag.into(),
            engine_version: crate::VERSION.to_string(),
            nodes_scheduled: 0,
            progressive_nodes: 0,
            nodes_completed: 0,
            progress_updates: 0,
            scratch_tables_dropped: 0,
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(mut self, finished_ms: u64) -> Self {
        self.finished_ms = finished_ms;
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.finished_ms.saturating_sub(self.started_ms)
    }
}
