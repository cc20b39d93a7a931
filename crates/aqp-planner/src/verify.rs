//! Structural checks for execution plans.
//!
//! Cheap enough to run after every rewrite in tests and debug builds.

use std::collections::BTreeSet;

use aqp_core::id::NodeId;

use crate::error::{PlanError, Result};
use crate::plan::QueryExecutionPlan;

/// Verify edges, acyclicity, reachability and the placeholder invariant.
pub fn check_invariants(plan: &QueryExecutionPlan) -> Result<()> {
    let Some(root) = plan.root() else {
        return if plan.is_empty() {
            Ok(())
        } else {
            Err(PlanError::Invariant("nodes without a root".into()))
        };
    };
    let root_node = plan.node(root).ok_or(PlanError::UnknownNode(root))?;
    if !root_node.parents.is_empty() {
        return Err(PlanError::Invariant(format!("root {root} has parents")));
    }

    let mut scratch = BTreeSet::new();
    for node in plan.nodes() {
        if node.id != root && node.parents.is_empty() {
            return Err(PlanError::Invariant(format!("{} has no parent", node.id)));
        }
        for d in &node.dependents {
            let dep = plan.node(*d).ok_or(PlanError::UnknownNode(*d))?;
            if !dep.parents.contains(&node.id) {
                return Err(PlanError::Invariant(format!(
                    "{} depends on {d} but is not among its parents",
                    node.id
                )));
            }
        }
        for p in &node.parents {
            let parent = plan.node(*p).ok_or(PlanError::UnknownNode(*p))?;
            if !parent.dependents.contains(&node.id) {
                return Err(PlanError::Invariant(format!(
                    "{} lists parent {p} which does not depend on it",
                    node.id
                )));
            }
        }

        let dependents: BTreeSet<NodeId> = node.dependents.iter().copied().collect();
        let in_query: BTreeSet<NodeId> = node.query.placeholders().iter().map(|p| p.node).collect();
        if in_query != dependents {
            return Err(PlanError::Invariant(format!(
                "{}: placeholders reference {:?}, dependents are {:?}",
                node.id, in_query, dependents
            )));
        }
        if node.placeholder_dependents() != dependents {
            return Err(PlanError::Invariant(format!(
                "{}: placeholder maps out of sync with dependents",
                node.id
            )));
        }
        if !scratch.insert(node.scratch_table.clone()) {
            return Err(PlanError::Invariant(format!(
                "scratch table {} used twice",
                node.scratch_table
            )));
        }
    }

    plan.topological_order()?;

    let reachable = plan.descendants(root);
    if reachable.len() + 1 != plan.len() {
        return Err(PlanError::Invariant(format!(
            "{} of {} nodes unreachable from root",
            plan.len() - reachable.len() - 1,
            plan.len()
        )));
    }
    Ok(())
}
