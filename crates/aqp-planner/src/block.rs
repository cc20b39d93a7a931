//! Aggregate blocks and their conversion to progressive nodes.
//!
//! A block is rooted at the first aggregate node on a path from the plan
//! root through projection nodes. It owns every descendant all of whose
//! parents are already in the block; other descendants reached from the
//! block are its external dependents and stay separate nodes.

use std::collections::{BTreeMap, BTreeSet};

use aqp_core::id::{NodeId, QueueId};
use aqp_core::query::{SelectQuery, TableName};
use serde::Serialize;

use crate::error::{PlanError, Result};
use crate::node::{NodeKind, PlaceholderFilter};
use crate::plan::QueryExecutionPlan;
use crate::progressive::{
    find_progress_table, first_non_decomposable, first_unscalable, ProgressiveSpec,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AggregateBlock {
    pub root: NodeId,
    /// Members other than the root, parents before their dependents.
    pub members: Vec<NodeId>,
    /// Nodes outside the block that some block node depends on.
    pub external_dependents: Vec<NodeId>,
}

impl AggregateBlock {
    pub fn contains(&self, id: NodeId) -> bool {
        self.root == id || self.members.contains(&id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotConvertedReason {
    NoScrambledTable,
    NonDecomposable(String),
    /// Early increments would be unscaled or biased prefix results.
    InconsistentEstimate(String),
    AlreadyProgressive,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockConversion {
    Converted {
        node: NodeId,
        table: TableName,
        blocks: u32,
        absorbed: Vec<NodeId>,
    },
    NotConverted {
        root: NodeId,
        reason: NotConvertedReason,
    },
}

impl BlockConversion {
    pub fn is_converted(&self) -> bool {
        matches!(self, BlockConversion::Converted { .. })
    }
}

pub fn identify_top_aggregate_blocks(plan: &QueryExecutionPlan) -> Result<Vec<AggregateBlock>> {
    let Some(root) = plan.root() else {
        return Ok(vec![]);
    };

    let mut roots = Vec::new();
    let mut seen = BTreeSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        let node = plan.node(id).ok_or(PlanError::UnknownNode(id))?;
        match node.kind {
            NodeKind::Aggregate => roots.push(id),
            NodeKind::Projection => stack.extend(node.dependents.iter().rev().copied()),
            NodeKind::Progressive(_) => {}
        }
    }

    // Parents before dependents.
    let mut top_down = plan.topological_order()?;
    top_down.reverse();

    let mut blocks = Vec::with_capacity(roots.len());
    for block_root in roots {
        let descendants = plan.descendants(block_root);
        let mut in_block = BTreeSet::from([block_root]);
        let mut members = Vec::new();
        for id in top_down.iter().filter(|id| descendants.contains(id)) {
            let node = plan.node(*id).ok_or(PlanError::UnknownNode(*id))?;
            if node.parents.iter().all(|p| in_block.contains(p)) {
                in_block.insert(*id);
                members.push(*id);
            }
        }
        let mut external = Vec::new();
        for id in &in_block {
            let node = plan.node(*id).ok_or(PlanError::UnknownNode(*id))?;
            for d in &node.dependents {
                if !in_block.contains(d) && !external.contains(d) {
                    external.push(*d);
                }
            }
        }
        tracing::debug!(
            root = %block_root,
            members = members.len(),
            external = external.len(),
            "identified aggregate block"
        );
        blocks.push(AggregateBlock {
            root: block_root,
            members,
            external_dependents: external,
        });
    }
    Ok(blocks)
}

pub fn convert_to_progressive(
    plan: &mut QueryExecutionPlan,
    block: &AggregateBlock,
) -> Result<BlockConversion> {
    let root = plan.node(block.root).ok_or(PlanError::UnknownNode(block.root))?;
    if root.is_progressive() {
        return Ok(BlockConversion::NotConverted {
            root: block.root,
            reason: NotConvertedReason::AlreadyProgressive,
        });
    }

    let inlined = inline_block(plan, block)?;

    let Some(scramble) = find_progress_table(&inlined, plan.catalog()) else {
        tracing::debug!(root = %block.root, "block reads no scrambled table");
        return Ok(BlockConversion::NotConverted {
            root: block.root,
            reason: NotConvertedReason::NoScrambledTable,
        });
    };
    if let Some(name) = first_non_decomposable(&inlined) {
        tracing::debug!(root = %block.root, aggregate = %name, "block is not decomposable");
        return Ok(BlockConversion::NotConverted {
            root: block.root,
            reason: NotConvertedReason::NonDecomposable(name),
        });
    }
    if let Some(why) = first_unscalable(&inlined, &scramble.name()) {
        tracing::debug!(root = %block.root, reason = %why, "block has no consistent increments");
        return Ok(BlockConversion::NotConverted {
            root: block.root,
            reason: NotConvertedReason::InconsistentEstimate(why),
        });
    }
    let plain: Vec<String> = inlined
        .base_tables()
        .into_iter()
        .filter(|t| plan.catalog().get(&t.name()).is_none())
        .map(|t| t.name().to_string())
        .collect();
    if !plain.is_empty() {
        tracing::debug!(
            root = %block.root,
            scrambled = %scramble.name(),
            plain = ?plain,
            "treating non-scrambled tables as dimension joins"
        );
    }

    // Placeholders for external dependents survive inlining; collect them
    // from every block node.
    let mut tables: BTreeMap<NodeId, Vec<_>> = BTreeMap::new();
    let mut filters: BTreeMap<NodeId, Vec<PlaceholderFilter>> = BTreeMap::new();
    let mut member_queues: BTreeSet<QueueId> = BTreeSet::new();
    for id in std::iter::once(block.root).chain(block.members.iter().copied()) {
        let node = plan.node(id).ok_or(PlanError::UnknownNode(id))?;
        if id != block.root {
            member_queues.extend(node.listening_queues.iter().copied());
        }
        for (dep, refs) in &node.placeholder_tables {
            if !block.contains(*dep) {
                tables.entry(*dep).or_default().extend(refs.iter().cloned());
            }
        }
        for (dep, refs) in &node.placeholder_filters {
            if !block.contains(*dep) {
                filters.entry(*dep).or_default().extend(refs.iter().cloned());
            }
        }
    }

    let existing_queue = plan
        .node(block.root)
        .and_then(|n| n.listening_queues.first().copied());
    let root_queue = match existing_queue {
        Some(q) => q,
        None if block.external_dependents.is_empty() => QueueId::new(0),
        None => plan.alloc_queue_id(),
    };

    let spec = ProgressiveSpec::new(scramble.clone());
    let blocks = spec.total_blocks();
    {
        let node = plan.node_mut(block.root)?;
        node.kind = NodeKind::Progressive(spec);
        node.query = inlined;
        node.dependents = block.external_dependents.clone();
        node.placeholder_tables = tables;
        node.placeholder_filters = filters;
        node.listening_queues = if block.external_dependents.is_empty() {
            vec![]
        } else {
            vec![root_queue]
        };
    }

    for ext in &block.external_dependents {
        let node = plan.node_mut(*ext)?;
        for m in &block.members {
            node.replace_parent(*m, block.root);
        }
        node.broadcasting_queues.retain(|q| !member_queues.contains(q));
        node.add_broadcasting_queue(root_queue);
    }
    for m in &block.members {
        plan.remove_node(*m);
    }

    tracing::info!(
        node = %block.root,
        table = %scramble.name(),
        blocks,
        absorbed = block.members.len(),
        "converted block to progressive aggregation"
    );
    Ok(BlockConversion::Converted {
        node: block.root,
        table: scramble.name(),
        blocks,
        absorbed: block.members.clone(),
    })
}

/// The block root's query with every member substituted at its placeholders.
fn inline_block(plan: &QueryExecutionPlan, block: &AggregateBlock) -> Result<SelectQuery> {
    let mut memo: BTreeMap<NodeId, SelectQuery> = BTreeMap::new();
    for id in block
        .members
        .iter()
        .rev()
        .copied()
        .chain(std::iter::once(block.root))
    {
        let node = plan.node(id).ok_or(PlanError::UnknownNode(id))?;
        let mut query = node.query.clone();
        for dep in &node.dependents {
            let Some(sub) = memo.get(dep) else {
                continue;
            };
            if query.replace_placeholder_table(*dep, sub) == 0
                && query.replace_placeholder_filter(*dep, sub) == 0
            {
                return Err(PlanError::Invariant(format!(
                    "placeholder for {dep} missing in {id}"
                )));
            }
        }
        memo.insert(id, query);
    }
    memo.remove(&block.root)
        .ok_or(PlanError::UnknownNode(block.root))
}

pub fn make_progressive_if_available(plan: &mut QueryExecutionPlan) -> Result<Vec<BlockConversion>> {
    let blocks = identify_top_aggregate_blocks(plan)?;
    let mut out = Vec::with_capacity(blocks.len());
    for block in &blocks {
        out.push(convert_to_progressive(plan, block)?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use aqp_core::query::{BaseTable, Expr, FromItem, SelectItem};
    use aqp_core::scramble::{ScrambleCatalog, ScrambleMeta};

    use crate::verify::check_invariants;

    fn catalog() -> Arc<ScrambleCatalog> {
        Arc::new(
            ScrambleCatalog::new()
                .with(ScrambleMeta::uniform("default", "people_scr", "blk", 3).unwrap())
                .unwrap(),
        )
    }

    fn scrambled() -> FromItem {
        FromItem::table(BaseTable::new("default", "people_scr").with_alias("s"))
    }

    #[test]
    fn projection_root_keeps_its_aggregate_child_separate() {
        let inner = SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("sum", vec![Expr::col("s", "age")]),
                "total",
            )],
            vec![scrambled()],
        )
        .with_group_by(vec![Expr::col("s", "city")])
        .with_alias("x");
        let query = SelectQuery::new(
            vec![SelectItem::new(Expr::col("x", "total"))],
            vec![FromItem::subquery(inner)],
        );
        let mut plan = QueryExecutionPlan::from_query("scratch", &query, catalog()).unwrap();
        let root = plan.root().unwrap();
        let child = plan.root_node().unwrap().dependents[0];

        let blocks = identify_top_aggregate_blocks(&plan).unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].root, child);
        assert!(blocks[0].members.is_empty());

        let out = convert_to_progressive(&mut plan, &blocks[0]).unwrap();
        assert!(out.is_converted());
        assert_eq!(plan.len(), 2);
        assert!(!plan.node(root).unwrap().is_progressive());
        let spec = plan.node(child).unwrap().progressive_spec().unwrap();
        assert_eq!(spec.total_blocks(), 3);
        check_invariants(&plan).unwrap();

        // A second attempt sees the converted node.
        let again = convert_to_progressive(&mut plan, &blocks[0]).unwrap();
        assert_eq!(
            again,
            BlockConversion::NotConverted {
                root: child,
                reason: NotConvertedReason::AlreadyProgressive
            }
        );
    }

    #[test]
    fn filter_dependent_is_absorbed_into_the_root() {
        // count(*) over the scramble, filtered by a grouped plain table.
        let cities = SelectQuery::new(
            vec![SelectItem::new(Expr::col("c", "name"))],
            vec![FromItem::table(
                BaseTable::new("default", "cities").with_alias("c"),
            )],
        )
        .with_group_by(vec![Expr::col("c", "name")]);
        let query = SelectQuery::new(
            vec![SelectItem::aliased(Expr::count_star(), "n")],
            vec![scrambled()],
        )
        .with_filter(Expr::in_subquery(Expr::col("s", "city"), cities));
        let mut plan = QueryExecutionPlan::from_query("scratch", &query, catalog()).unwrap();
        assert_eq!(plan.len(), 2);
        let root = plan.root().unwrap();

        let conversions = plan.make_progressive_if_available().unwrap();
        assert_eq!(conversions.len(), 1);
        match &conversions[0] {
            BlockConversion::Converted {
                node,
                table,
                absorbed,
                ..
            } => {
                assert_eq!(*node, root);
                assert_eq!(table.table, "people_scr");
                assert_eq!(absorbed.len(), 1);
            }
            other => panic!("expected conversion, got {other:?}"),
        }
        assert_eq!(plan.len(), 1);
        let node = plan.root_node().unwrap();
        assert!(node.dependents.is_empty());
        assert!(node.listening_queues.is_empty());
        assert!(node.query.placeholders().is_empty());
        check_invariants(&plan).unwrap();
    }

    #[test]
    fn scramble_behind_a_filter_subquery_is_not_converted() {
        let ids = SelectQuery::new(vec![SelectItem::new(Expr::col("s", "id"))], vec![scrambled()])
            .with_group_by(vec![Expr::col("s", "id")]);
        let query = SelectQuery::new(
            vec![SelectItem::aliased(Expr::count_star(), "n")],
            vec![FromItem::table(
                BaseTable::new("default", "orders").with_alias("o"),
            )],
        )
        .with_filter(Expr::in_subquery(Expr::col("o", "cust"), ids));
        let mut plan = QueryExecutionPlan::from_query("scratch", &query, catalog()).unwrap();
        let root = plan.root().unwrap();
        let conversions = plan.make_progressive_if_available().unwrap();
        assert_eq!(
            conversions,
            vec![BlockConversion::NotConverted {
                root,
                reason: NotConvertedReason::InconsistentEstimate(
                    "sub-query over default.people_scr in an expression".into()
                ),
            }]
        );
        assert_eq!(plan.len(), 2);
        assert!(plan.progressive_nodes().is_empty());
    }

    #[test]
    fn count_over_groups_is_not_converted() {
        // SELECT count(*) FROM (SELECT s.city FROM people_scr s GROUP BY s.city) g
        let groups = SelectQuery::new(
            vec![SelectItem::new(Expr::col("s", "city"))],
            vec![scrambled()],
        )
        .with_group_by(vec![Expr::col("s", "city")])
        .with_alias("g");
        let query = SelectQuery::new(
            vec![SelectItem::new(Expr::count_star())],
            vec![FromItem::subquery(groups)],
        );
        let mut plan = QueryExecutionPlan::from_query("scratch", &query, catalog()).unwrap();
        let root = plan.root().unwrap();
        let conversions = plan.make_progressive_if_available().unwrap();
        assert_eq!(
            conversions,
            vec![BlockConversion::NotConverted {
                root,
                reason: NotConvertedReason::InconsistentEstimate(
                    "aggregate over pre-aggregated rows of default.people_scr".into()
                ),
            }]
        );
        assert_eq!(plan.len(), 2);
    }

    #[test]
    fn max_is_not_decomposable() {
        let query = SelectQuery::new(
            vec![SelectItem::new(Expr::func("max", vec![Expr::col("s", "age")]))],
            vec![scrambled()],
        );
        let mut plan = QueryExecutionPlan::from_query("scratch", &query, catalog()).unwrap();
        let before = plan.root_node().unwrap().clone();
        let conversions = plan.make_progressive_if_available().unwrap();
        assert_eq!(
            conversions,
            vec![BlockConversion::NotConverted {
                root: before.id,
                reason: NotConvertedReason::NonDecomposable("max".into())
            }]
        );
        assert_eq!(plan.root_node().unwrap(), &before);
    }
}
