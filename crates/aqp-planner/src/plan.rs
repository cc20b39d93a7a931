//! The query execution plan: an arena of nodes plus the identifier namespace
//! every scratch table and alias of the plan is drawn from.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aqp_core::hash::{hash_serde, Hash256};
use aqp_core::id::{NodeId, QueueId};
use aqp_core::query::{SelectQuery, TableName};
use aqp_core::scramble::ScrambleCatalog;
use aqp_core::sql::{SqlGenerator, SqlSyntax};
use serde::Serialize;
use uuid::Uuid;

use crate::block::{self, BlockConversion};
use crate::compress::{self, CompressionReport};
use crate::error::{PlanError, Result};
use crate::node::ExecutionNode;

const ALIAS_PREFIX: &str = "aqpalias";
const TEMP_TABLE_PREFIX: &str = "aqptemptable";

#[derive(Debug)]
pub struct QueryExecutionPlan {
    nodes: BTreeMap<NodeId, ExecutionNode>,
    root: Option<NodeId>,
    catalog: Arc<ScrambleCatalog>,
    scratch_schema: String,
    instance_tag: String,
    identifiers: AtomicU64,
    next_node: u64,
    next_queue: u64,
    source: Option<SelectQuery>,
}

impl Clone for QueryExecutionPlan {
    fn clone(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            root: self.root,
            catalog: Arc::clone(&self.catalog),
            scratch_schema: self.scratch_schema.clone(),
            instance_tag: self.instance_tag.clone(),
            identifiers: AtomicU64::new(self.identifiers.load(Ordering::Relaxed)),
            next_node: self.next_node,
            next_queue: self.next_queue,
            source: self.source.clone(),
        }
    }
}

#[derive(Serialize)]
struct PlanSnapshot<'a> {
    root: Option<NodeId>,
    nodes: Vec<&'a ExecutionNode>,
}

impl QueryExecutionPlan {
    pub fn new(scratch_schema: impl Into<String>, catalog: Arc<ScrambleCatalog>) -> Self {
        let instance_tag: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self {
            nodes: BTreeMap::new(),
            root: None,
            catalog,
            scratch_schema: scratch_schema.into(),
            instance_tag,
            identifiers: AtomicU64::new(0),
            next_node: 0,
            next_queue: 0,
            source: None,
        }
    }

    /// New plan built from `query`.
    pub fn from_query(
        scratch_schema: impl Into<String>,
        query: &SelectQuery,
        catalog: Arc<ScrambleCatalog>,
    ) -> Result<Self> {
        let mut plan = Self::new(scratch_schema, catalog);
        plan.build(query)?;
        Ok(plan)
    }

    /// Decompose `query` into nodes. Fails without touching the plan when the
    /// query cannot be planned.
    pub fn build(&mut self, query: &SelectQuery) -> Result<NodeId> {
        if let Some(root) = self.root {
            return Err(PlanError::AlreadyBuilt(root));
        }
        let root = crate::builder::build(self, query)?;
        self.root = Some(root);
        self.source = Some(query.clone());
        tracing::info!(
            tag = %self.instance_tag,
            nodes = self.nodes.len(),
            root = %root,
            "built execution plan"
        );
        Ok(root)
    }

    pub fn compress(&mut self) -> CompressionReport {
        compress::compress(self)
    }

    pub fn make_progressive_if_available(&mut self) -> Result<Vec<BlockConversion>> {
        block::make_progressive_if_available(self)
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn root_node(&self) -> Result<&ExecutionNode> {
        let root = self
            .root
            .ok_or_else(|| PlanError::Invariant("plan has not been built".into()))?;
        self.node(root).ok_or(PlanError::UnknownNode(root))
    }

    pub fn node(&self, id: NodeId) -> Option<&ExecutionNode> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ExecutionNode> {
        self.nodes.values()
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn catalog(&self) -> &Arc<ScrambleCatalog> {
        &self.catalog
    }

    pub fn scratch_schema(&self) -> &str {
        &self.scratch_schema
    }

    pub fn instance_tag(&self) -> &str {
        &self.instance_tag
    }

    /// The query the plan was built from.
    pub fn source_query(&self) -> Option<&SelectQuery> {
        self.source.as_ref()
    }

    /// `<tag>_<n>`; unique within the plan and, through the tag, across
    /// plans alive in the same process. Safe to call from many threads.
    pub fn generate_unique_identifier(&self) -> String {
        let n = self.identifiers.fetch_add(1, Ordering::Relaxed);
        format!("{}_{}", self.instance_tag, n)
    }

    pub fn generate_alias_name(&self) -> String {
        format!("{ALIAS_PREFIX}_{}", self.generate_unique_identifier())
    }

    pub fn generate_temp_table_name(&self) -> String {
        format!("{TEMP_TABLE_PREFIX}_{}", self.generate_unique_identifier())
    }

    /// Scratch tables written by non-root nodes.
    pub fn scratch_tables(&self) -> Vec<TableName> {
        self.nodes
            .values()
            .filter(|n| Some(n.id) != self.root)
            .map(|n| n.scratch_table.clone())
            .collect()
    }

    pub fn progressive_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| n.is_progressive())
            .map(|n| n.id)
            .collect()
    }

    /// Node ids with every node after all of its dependents.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut pending: BTreeMap<NodeId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id, n.dependents.len()))
            .collect();
        let mut ready: VecDeque<NodeId> = pending
            .iter()
            .filter(|(_, c)| **c == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let node = self.node(id).ok_or(PlanError::UnknownNode(id))?;
            for parent in &node.parents {
                let count = pending
                    .get_mut(parent)
                    .ok_or(PlanError::UnknownNode(*parent))?;
                *count = count.saturating_sub(1);
                if *count == 0 {
                    ready.push_back(*parent);
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(PlanError::Invariant(format!(
                "cycle among {} nodes",
                self.nodes.len() - order.len()
            )));
        }
        Ok(order)
    }

    /// Nodes reachable from `from` through `dependents`, `from` excluded.
    pub fn descendants(&self, from: NodeId) -> BTreeSet<NodeId> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.node(id) {
                for d in &node.dependents {
                    if seen.insert(*d) {
                        stack.push(*d);
                    }
                }
            }
        }
        seen
    }

    pub fn fingerprint(&self) -> Result<Hash256> {
        let snapshot = PlanSnapshot {
            root: self.root,
            nodes: self.nodes.values().collect(),
        };
        Ok(hash_serde(&snapshot)?)
    }

    /// Human-readable rendering, root first, dependents indented below their
    /// consumer. Shared nodes are printed once.
    pub fn explain(&self, syntax: &dyn SqlSyntax) -> Result<String> {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "plan {} ({} node{})",
            self.instance_tag,
            self.nodes.len(),
            if self.nodes.len() == 1 { "" } else { "s" }
        );
        let Some(root) = self.root else {
            return Ok(out);
        };
        let gen = SqlGenerator::new(syntax);
        let mut printed = BTreeSet::new();
        self.explain_node(&gen, root, 0, &mut printed, &mut out)?;
        Ok(out)
    }

    fn explain_node(
        &self,
        gen: &SqlGenerator<'_>,
        id: NodeId,
        depth: usize,
        printed: &mut BTreeSet<NodeId>,
        out: &mut String,
    ) -> Result<()> {
        let pad = "  ".repeat(depth);
        let node = self.node(id).ok_or(PlanError::UnknownNode(id))?;
        if !printed.insert(id) {
            let _ = writeln!(out, "{pad}- {id} (shared, see above)");
            return Ok(());
        }
        let target = if Some(id) == self.root {
            "result".to_string()
        } else {
            node.scratch_table.to_string()
        };
        let _ = write!(out, "{pad}- {id} [{}] -> {target}", node.kind.label());
        if let Some(spec) = node.progressive_spec() {
            let _ = write!(
                out,
                " over {} in {} blocks",
                spec.scramble.name(),
                spec.total_blocks()
            );
        }
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "{pad}  listens {} / broadcasts {}",
            queue_list(&node.listening_queues),
            queue_list(&node.broadcasting_queues)
        );
        let _ = writeln!(out, "{pad}  {}", gen.select(&node.query)?);
        for d in &node.dependents {
            self.explain_node(gen, *d, depth + 1, printed, out)?;
        }
        Ok(())
    }

    pub(crate) fn alloc_node_id(&mut self) -> NodeId {
        let id = NodeId::new(self.next_node);
        self.next_node += 1;
        id
    }

    pub(crate) fn alloc_queue_id(&mut self) -> QueueId {
        let id = QueueId::new(self.next_queue);
        self.next_queue += 1;
        id
    }

    pub(crate) fn insert_node(&mut self, node: ExecutionNode) {
        self.nodes.insert(node.id, node);
    }

    pub(crate) fn remove_node(&mut self, id: NodeId) -> Option<ExecutionNode> {
        self.nodes.remove(&id)
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut ExecutionNode> {
        self.nodes.get_mut(&id).ok_or(PlanError::UnknownNode(id))
    }
}

fn queue_list(queues: &[QueueId]) -> String {
    if queues.is_empty() {
        return "-".to_string();
    }
    queues
        .iter()
        .map(|q| q.get().to_string())
        .collect::<Vec<_>>()
        .join(",")
}
