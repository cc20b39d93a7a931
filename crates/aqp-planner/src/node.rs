//! Execution nodes: one independently materializable query of a plan.
//!
//! Nodes live in the plan's arena and refer to each other by `NodeId` only.
//! `dependents` are the producers a node reads from; `parents` are the
//! consumers of its output.

use std::collections::{BTreeMap, BTreeSet};

use aqp_core::id::{NodeId, QueueId};
use aqp_core::query::{PlaceholderRef, SelectQuery, SubqueryKind, TableName};
use serde::{Deserialize, Serialize};

use crate::progressive::ProgressiveSpec;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Selects from its dependents without aggregating at its own level.
    Projection,
    Aggregate,
    /// Replaces an aggregate block; runs once per block prefix.
    Progressive(ProgressiveSpec),
}

impl NodeKind {
    pub fn label(&self) -> &'static str {
        match self {
            NodeKind::Projection => "projection",
            NodeKind::Aggregate => "aggregate",
            NodeKind::Progressive(_) => "progressive",
        }
    }
}

/// A dependent consumed as a scalar / IN / EXISTS sub-query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderFilter {
    pub kind: SubqueryKind,
    pub placeholder: PlaceholderRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionNode {
    pub id: NodeId,
    pub kind: NodeKind,
    pub query: SelectQuery,
    pub parents: Vec<NodeId>,
    pub dependents: Vec<NodeId>,
    pub placeholder_tables: BTreeMap<NodeId, Vec<PlaceholderRef>>,
    pub placeholder_filters: BTreeMap<NodeId, Vec<PlaceholderFilter>>,
    pub broadcasting_queues: Vec<QueueId>,
    pub listening_queues: Vec<QueueId>,
    /// Where this node materializes its output (unused for the root).
    pub scratch_table: TableName,
}

impl ExecutionNode {
    pub fn new(id: NodeId, kind: NodeKind, query: SelectQuery, scratch_table: TableName) -> Self {
        Self {
            id,
            kind,
            query,
            parents: vec![],
            dependents: vec![],
            placeholder_tables: BTreeMap::new(),
            placeholder_filters: BTreeMap::new(),
            broadcasting_queues: vec![],
            listening_queues: vec![],
            scratch_table,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_progressive(&self) -> bool {
        matches!(self.kind, NodeKind::Progressive(_))
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(self.kind, NodeKind::Aggregate)
    }

    pub fn progressive_spec(&self) -> Option<&ProgressiveSpec> {
        match &self.kind {
            NodeKind::Progressive(spec) => Some(spec),
            NodeKind::Projection | NodeKind::Aggregate => None,
        }
    }

    pub fn broadcast_set(&self) -> BTreeSet<QueueId> {
        self.broadcasting_queues.iter().copied().collect()
    }

    /// Dependents referenced by some placeholder entry.
    pub fn placeholder_dependents(&self) -> BTreeSet<NodeId> {
        let tables = self
            .placeholder_tables
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k);
        let filters = self
            .placeholder_filters
            .iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, _)| *k);
        tables.chain(filters).collect()
    }

    pub(crate) fn add_parent(&mut self, parent: NodeId) {
        if !self.parents.contains(&parent) {
            self.parents.push(parent);
        }
    }

    pub(crate) fn add_dependent(&mut self, dependent: NodeId) {
        if !self.dependents.contains(&dependent) {
            self.dependents.push(dependent);
        }
    }

    pub(crate) fn add_listening_queue(&mut self, queue: QueueId) {
        if !self.listening_queues.contains(&queue) {
            self.listening_queues.push(queue);
        }
    }

    pub(crate) fn add_broadcasting_queue(&mut self, queue: QueueId) {
        if !self.broadcasting_queues.contains(&queue) {
            self.broadcasting_queues.push(queue);
        }
    }

    /// Replace `old` with `new` in the parent list, keeping order and
    /// dropping duplicates.
    pub(crate) fn replace_parent(&mut self, old: NodeId, new: NodeId) {
        let mut out = Vec::with_capacity(self.parents.len());
        for p in self.parents.drain(..) {
            let p = if p == old { new } else { p };
            if !out.contains(&p) {
                out.push(p);
            }
        }
        self.parents = out;
    }

    /// Drop the edge to `dependent` and every placeholder entry for it.
    pub(crate) fn remove_dependent(&mut self, dependent: NodeId) {
        self.dependents.retain(|d| *d != dependent);
        self.placeholder_tables.remove(&dependent);
        self.placeholder_filters.remove(&dependent);
    }
}
