//! Bottom-up compression: merge a node into its sole parent when the merge
//! cannot change how the parent is synchronized.
//!
//! A merge inlines the child's query at its placeholder(s) in the parent and
//! rewires the child's dependents to the parent. The pass runs to a fixed
//! point, so running it again is a no-op.

use std::collections::{BTreeSet, VecDeque};

use aqp_core::id::{NodeId, QueueId};

use crate::error::{PlanError, Result};
use crate::plan::QueryExecutionPlan;

#[derive(Debug, Default)]
pub struct CompressionReport {
    /// `(merged node, parent it was merged into)`, in merge order.
    pub merged: Vec<(NodeId, NodeId)>,
    /// Nodes left unmerged because the merge would break a plan invariant.
    pub violations: Vec<PlanError>,
    /// Work-list pops.
    pub steps: usize,
}

impl CompressionReport {
    pub fn merged_count(&self) -> usize {
        self.merged.len()
    }

    pub fn is_noop(&self) -> bool {
        self.merged.is_empty()
    }
}

pub(crate) fn compress(plan: &mut QueryExecutionPlan) -> CompressionReport {
    let mut report = CompressionReport::default();
    let Some(root) = plan.root() else {
        return report;
    };
    let before = plan.len();

    let mut worklist = VecDeque::new();
    let mut queued = BTreeSet::new();
    for leaf in leaves(plan, root) {
        enqueue(&mut worklist, &mut queued, leaf);
    }
    let mut failed = BTreeSet::new();

    while let Some(n) = worklist.pop_front() {
        queued.remove(&n);
        report.steps += 1;
        let Some(node) = plan.node(n) else {
            continue;
        };
        let parents = node.parents.clone();

        let target = if failed.contains(&n) {
            None
        } else {
            compressible(plan, n)
        };
        let Some(p) = target else {
            for parent in parents {
                enqueue(&mut worklist, &mut queued, parent);
            }
            continue;
        };

        match merge(plan, n, p) {
            Ok(former_dependents) => {
                tracing::debug!(node = %n, into = %p, "compressed node into parent");
                report.merged.push((n, p));
                enqueue(&mut worklist, &mut queued, p);
                let siblings = plan.node(p).map(|p| p.dependents.clone()).unwrap_or_default();
                for d in siblings.into_iter().chain(former_dependents) {
                    enqueue(&mut worklist, &mut queued, d);
                }
            }
            Err(e) => {
                tracing::warn!(node = %n, parent = %p, error = %e, "leaving node unmerged");
                failed.insert(n);
                report.violations.push(e);
                enqueue(&mut worklist, &mut queued, p);
            }
        }
    }

    tracing::info!(
        before,
        after = plan.len(),
        merged = report.merged.len(),
        violations = report.violations.len(),
        "compression finished"
    );
    report
}

/// Breadth-first from the root; nodes without dependents, in visit order.
fn leaves(plan: &QueryExecutionPlan, root: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut seen = BTreeSet::from([root]);
    let mut frontier = VecDeque::from([root]);
    while let Some(id) = frontier.pop_front() {
        let Some(node) = plan.node(id) else {
            continue;
        };
        if node.dependents.is_empty() {
            out.push(id);
        }
        for d in &node.dependents {
            if seen.insert(*d) {
                frontier.push_back(*d);
            }
        }
    }
    out
}

fn enqueue(worklist: &mut VecDeque<NodeId>, queued: &mut BTreeSet<NodeId>, id: NodeId) {
    if queued.insert(id) {
        worklist.push_back(id);
    }
}

/// The parent `n` may be merged into, if any.
fn compressible(plan: &QueryExecutionPlan, n: NodeId) -> Option<NodeId> {
    let node = plan.node(n)?;
    if Some(n) == plan.root() || node.is_progressive() {
        return None;
    }
    let [p] = node.parents.as_slice() else {
        return None;
    };
    let parent = plan.node(*p)?;
    if parent.is_progressive() {
        return None;
    }
    let sets: Vec<BTreeSet<QueueId>> = parent
        .dependents
        .iter()
        .filter_map(|d| plan.node(*d))
        .map(|d| d.broadcast_set())
        .collect();
    sets.windows(2).all(|w| w[0] == w[1]).then_some(*p)
}

/// Inline `n` into `p`. Returns `n`'s former dependents.
///
/// `n`'s dependents take over `n`'s slot on `p`'s listening queue, so every
/// dependent of `p` still signals `p` on the same queue.
fn merge(plan: &mut QueryExecutionPlan, n: NodeId, p: NodeId) -> Result<Vec<NodeId>> {
    let child = plan.node(n).ok_or(PlanError::UnknownNode(n))?.clone();
    let parent = plan.node(p).ok_or(PlanError::UnknownNode(p))?;

    let mut query = parent.query.clone();
    let mut replaced = query.replace_placeholder_table(n, &child.query);
    if replaced == 0 {
        replaced = query.replace_placeholder_filter(n, &child.query);
    }
    if replaced == 0 {
        return Err(PlanError::CompressionInvariantViolation { node: n, parent: p });
    }
    let slot = child
        .broadcasting_queues
        .iter()
        .copied()
        .find(|q| parent.listening_queues.contains(q));
    if slot.is_none() && !child.dependents.is_empty() {
        return Err(PlanError::Invariant(format!(
            "{n} broadcasts on none of the queues {p} listens on"
        )));
    }

    let parent = plan.node_mut(p)?;
    parent.query = query;
    parent.remove_dependent(n);
    for d in &child.dependents {
        parent.add_dependent(*d);
    }
    // The child's query was copied once per placeholder it replaced.
    for _ in 0..replaced {
        for (dep, refs) in &child.placeholder_tables {
            parent
                .placeholder_tables
                .entry(*dep)
                .or_default()
                .extend(refs.iter().cloned());
        }
        for (dep, refs) in &child.placeholder_filters {
            parent
                .placeholder_filters
                .entry(*dep)
                .or_default()
                .extend(refs.iter().cloned());
        }
    }

    for d in &child.dependents {
        let node = plan.node_mut(*d)?;
        node.replace_parent(n, p);
        node.broadcasting_queues
            .retain(|q| !child.listening_queues.contains(q));
        if let Some(q) = slot {
            node.add_broadcasting_queue(q);
        }
    }

    let dependents = plan.node(p).map(|p| p.dependents.clone()).unwrap_or_default();
    let live: BTreeSet<QueueId> = dependents
        .iter()
        .filter_map(|d| plan.node(*d))
        .flat_map(|d| d.broadcasting_queues.iter().copied())
        .collect();
    plan.node_mut(p)?
        .listening_queues
        .retain(|q| live.contains(q));
    plan.remove_node(n);
    Ok(child.dependents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aqp_core::query::{BaseTable, Expr, FromItem, PlaceholderRef, SelectItem, SelectQuery};
    use aqp_core::scramble::ScrambleCatalog;

    use crate::verify::check_invariants;

    fn nested() -> SelectQuery {
        let inner = SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("avg", vec![Expr::col("t", "y")]),
                "x",
            )],
            vec![FromItem::table(BaseTable::new("default", "t").with_alias("t"))],
        )
        .with_group_by(vec![Expr::col("t", "z")])
        .with_alias("s");
        SelectQuery::new(
            vec![SelectItem::new(Expr::col("s", "x"))],
            vec![FromItem::subquery(inner)],
        )
    }

    #[test]
    fn merges_single_child_and_is_idempotent() {
        let mut plan =
            QueryExecutionPlan::from_query("scratch", &nested(), Arc::new(ScrambleCatalog::new()))
                .unwrap();
        assert_eq!(plan.len(), 2);

        let report = plan.compress();
        assert_eq!(report.merged_count(), 1);
        assert!(report.violations.is_empty());
        assert_eq!(plan.len(), 1);

        let root = plan.root_node().unwrap();
        assert!(root.dependents.is_empty());
        assert!(root.listening_queues.is_empty());
        assert!(root.query.placeholders().is_empty());

        let again = plan.compress();
        assert!(again.is_noop());
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn missing_placeholder_is_recorded_not_fatal() {
        let mut plan =
            QueryExecutionPlan::from_query("scratch", &nested(), Arc::new(ScrambleCatalog::new()))
                .unwrap();
        let root = plan.root().unwrap();
        // Simulate a corrupted parent query.
        plan.node_mut(root).unwrap().query.from_list =
            vec![FromItem::table(BaseTable::new("default", "t"))];

        let report = plan.compress();
        assert!(report.is_noop());
        assert_eq!(report.violations.len(), 1);
        assert!(matches!(
            report.violations[0],
            PlanError::CompressionInvariantViolation { parent, .. } if parent == root
        ));
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn merged_child_hands_its_queue_slot_to_its_dependents() {
        // root <- mid <- leaf; merge mid first.
        let leaf = SelectQuery::new(
            vec![SelectItem::aliased(Expr::count_star(), "c")],
            vec![FromItem::table(BaseTable::new("default", "t").with_alias("t"))],
        )
        .with_alias("l");
        let mid = SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("sum", vec![Expr::col("l", "c")]),
                "c",
            )],
            vec![FromItem::subquery(leaf)],
        )
        .with_alias("m");
        let query = SelectQuery::new(
            vec![SelectItem::new(Expr::col("m", "c"))],
            vec![FromItem::subquery(mid)],
        );
        let mut plan =
            QueryExecutionPlan::from_query("scratch", &query, Arc::new(ScrambleCatalog::new()))
                .unwrap();
        let root = plan.root().unwrap();
        let mid = plan.root_node().unwrap().dependents[0];
        let leaf = plan.node(mid).unwrap().dependents[0];
        let root_queue = plan.root_node().unwrap().listening_queues.clone();

        let moved = merge(&mut plan, mid, root).unwrap();
        assert_eq!(moved, vec![leaf]);
        let root_node = plan.root_node().unwrap();
        assert_eq!(root_node.listening_queues, root_queue);
        assert_eq!(root_node.dependents, vec![leaf]);
        let leaf_node = plan.node(leaf).unwrap();
        assert_eq!(leaf_node.parents, vec![root]);
        assert_eq!(leaf_node.broadcasting_queues, root_queue);
        check_invariants(&plan).unwrap();
    }

    fn grouped(table: &str, alias: &str) -> SelectQuery {
        SelectQuery::new(
            vec![SelectItem::aliased(Expr::count_star(), "c")],
            vec![FromItem::table(BaseTable::new("default", table).with_alias("t"))],
        )
        .with_group_by(vec![Expr::col("t", "k")])
        .with_alias(alias)
    }

    #[test]
    fn shared_dependent_blocks_merging() {
        let query = SelectQuery::new(
            vec![
                SelectItem::new(Expr::col("a", "c")),
                SelectItem::new(Expr::col("b", "c")),
            ],
            vec![
                FromItem::subquery(grouped("t1", "a")),
                FromItem::subquery(grouped("t2", "b")),
            ],
        );
        let mut plan =
            QueryExecutionPlan::from_query("scratch", &query, Arc::new(ScrambleCatalog::new()))
                .unwrap();
        assert_eq!(plan.len(), 3);
        let root = plan.root_node().unwrap();
        let (a, b) = (root.dependents[0], root.dependents[1]);

        // Make `b` read `a` too, so `a` has two consumers.
        let queue = plan.alloc_queue_id();
        let a_table = plan.node(a).unwrap().scratch_table.clone();
        let placeholder = PlaceholderRef {
            node: a,
            table: a_table,
            alias: "shared".into(),
        };
        {
            let node = plan.node_mut(b).unwrap();
            node.add_dependent(a);
            node.add_listening_queue(queue);
            node.query
                .from_list
                .push(FromItem::Placeholder(placeholder.clone()));
            node.placeholder_tables.entry(a).or_default().push(placeholder);
        }
        {
            let node = plan.node_mut(a).unwrap();
            node.add_parent(b);
            node.add_broadcasting_queue(queue);
        }
        check_invariants(&plan).unwrap();

        // `a` has two parents; `b` differs from its sibling in what it
        // broadcasts to.
        let report = plan.compress();
        assert!(report.is_noop());
        assert!(report.violations.is_empty());
        assert_eq!(plan.len(), 3);
        check_invariants(&plan).unwrap();
    }
}
