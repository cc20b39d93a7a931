//! Recursive decomposition of an aggregate query into execution nodes.
//!
//! Every aggregate-level sub-query found in a from-list or filter position
//! becomes a child node; its slot in the parent is replaced by a placeholder.
//! Non-aggregate derived tables and filter sub-queries are descended into but
//! are not nodes themselves. Correlated sub-queries stay inline.

use aqp_core::id::NodeId;
use aqp_core::query::{Expr, FromItem, PlaceholderRef, SelectQuery, SubqueryKind, TableName};

use crate::error::{PlanError, Result};
use crate::node::{ExecutionNode, NodeKind, PlaceholderFilter};
use crate::plan::QueryExecutionPlan;

enum ChildLink {
    Table(PlaceholderRef),
    Filter(SubqueryKind, PlaceholderRef),
}

impl ChildLink {
    fn node(&self) -> NodeId {
        match self {
            ChildLink::Table(p) | ChildLink::Filter(_, p) => p.node,
        }
    }
}

pub(crate) fn build(plan: &mut QueryExecutionPlan, query: &SelectQuery) -> Result<NodeId> {
    validate(query)?;
    create_node(plan, query.clone())
}

/// All build-time checks; runs before any node or identifier is created.
pub fn validate(query: &SelectQuery) -> Result<()> {
    if !query.is_aggregate() {
        return Err(PlanError::NotAggregate);
    }
    check_positions(query)?;
    if let Some(alias) = query.free_table_refs().into_iter().next() {
        return Err(PlanError::CorrelationUnsupported { alias });
    }
    Ok(())
}

fn check_positions(q: &SelectQuery) -> Result<()> {
    let inline_clauses: [(&'static str, Vec<&Expr>); 4] = [
        ("select list", q.select_list.iter().map(|s| &s.expr).collect()),
        ("GROUP BY", q.group_by.iter().collect()),
        ("HAVING", q.having.iter().collect()),
        ("ORDER BY", q.order_by.iter().map(|o| &o.expr).collect()),
    ];
    for (clause, exprs) in inline_clauses {
        let mut offending = false;
        for expr in exprs {
            expr.for_each_subquery(&mut |_, sub| {
                offending |= sub.is_aggregate() && !sub.is_correlated();
            });
        }
        if offending {
            return Err(PlanError::UnsupportedPosition { clause });
        }
    }

    for item in &q.from_list {
        check_from_item(item)?;
    }
    if let Some(filter) = &q.filter {
        let mut nested = Vec::new();
        filter.for_each_subquery(&mut |_, sub| nested.push(sub));
        for sub in nested {
            if !sub.is_correlated() {
                check_positions(sub)?;
            }
        }
    }
    Ok(())
}

fn check_from_item(item: &FromItem) -> Result<()> {
    match item {
        FromItem::Subquery(sub) if !sub.is_correlated() => check_positions(sub),
        FromItem::Join(j) => {
            if let Some(on) = &j.on {
                let mut offending = false;
                on.for_each_subquery(&mut |_, sub| {
                    offending |= sub.is_aggregate() && !sub.is_correlated();
                });
                if offending {
                    return Err(PlanError::UnsupportedPosition { clause: "ON" });
                }
            }
            check_from_item(&j.left)?;
            check_from_item(&j.right)
        }
        FromItem::Subquery(_) | FromItem::Table(_) | FromItem::Placeholder(_) => Ok(()),
    }
}

fn create_node(plan: &mut QueryExecutionPlan, query: SelectQuery) -> Result<NodeId> {
    let id = plan.alloc_node_id();
    let scratch_table = TableName::new(plan.scratch_schema(), plan.generate_temp_table_name());
    let kind = if query.is_aggregate_level() {
        NodeKind::Aggregate
    } else {
        NodeKind::Projection
    };

    let mut rewritten = query;
    let mut links = Vec::new();
    extract_level(plan, &mut rewritten, &mut links)?;

    let mut node = ExecutionNode::new(id, kind, rewritten, scratch_table);
    if !links.is_empty() {
        let queue = plan.alloc_queue_id();
        node.add_listening_queue(queue);
        for link in links {
            let child = link.node();
            node.add_dependent(child);
            match link {
                ChildLink::Table(placeholder) => {
                    node.placeholder_tables.entry(child).or_default().push(placeholder);
                }
                ChildLink::Filter(kind, placeholder) => {
                    node.placeholder_filters
                        .entry(child)
                        .or_default()
                        .push(PlaceholderFilter { kind, placeholder });
                }
            }
            let child_node = plan.node_mut(child)?;
            child_node.add_parent(id);
            child_node.add_broadcasting_queue(queue);
        }
    }

    tracing::debug!(
        node = %id,
        kind = node.kind.label(),
        dependents = node.dependents.len(),
        scratch = %node.scratch_table,
        "created execution node"
    );
    plan.insert_node(node);
    Ok(id)
}

/// Pull child nodes out of one query level: its from-list (through joins and
/// non-aggregate derived tables) and its filter.
fn extract_level(
    plan: &mut QueryExecutionPlan,
    q: &mut SelectQuery,
    links: &mut Vec<ChildLink>,
) -> Result<()> {
    for item in q.from_list.iter_mut() {
        extract_from_item(plan, item, links)?;
    }
    if let Some(filter) = q.filter.as_mut() {
        extract_filter(plan, filter, links)?;
    }
    Ok(())
}

fn extract_from_item(
    plan: &mut QueryExecutionPlan,
    item: &mut FromItem,
    links: &mut Vec<ChildLink>,
) -> Result<()> {
    match item {
        FromItem::Subquery(sub) => {
            if sub.is_correlated() {
                return Ok(());
            }
            if !sub.is_aggregate_level() {
                return extract_level(plan, sub, links);
            }
            let alias = match &sub.alias {
                Some(alias) => alias.clone(),
                None => plan.generate_alias_name(),
            };
            let mut child_query = (**sub).clone();
            child_query.alias = None;
            let child = create_node(plan, child_query)?;
            let placeholder = placeholder_for(plan, child, alias)?;
            links.push(ChildLink::Table(placeholder.clone()));
            *item = FromItem::Placeholder(placeholder);
            Ok(())
        }
        FromItem::Join(j) => {
            extract_from_item(plan, &mut j.left, links)?;
            extract_from_item(plan, &mut j.right, links)
        }
        FromItem::Table(_) | FromItem::Placeholder(_) => Ok(()),
    }
}

fn extract_filter(
    plan: &mut QueryExecutionPlan,
    filter: &mut Expr,
    links: &mut Vec<ChildLink>,
) -> Result<()> {
    let mut failure = None;
    filter.for_each_subquery_mut(&mut |kind, sub| {
        if failure.is_some() || sub.is_correlated() {
            return;
        }
        if let Err(e) = extract_filter_subquery(&mut *plan, kind, sub, &mut *links) {
            failure = Some(e);
        }
    });
    failure.map_or(Ok(()), Err)
}

fn extract_filter_subquery(
    plan: &mut QueryExecutionPlan,
    kind: SubqueryKind,
    sub: &mut SelectQuery,
    links: &mut Vec<ChildLink>,
) -> Result<()> {
    if !sub.is_aggregate_level() {
        return extract_level(plan, sub, links);
    }
    let mut child_query = sub.clone();
    child_query.alias = None;
    let child = create_node(plan, child_query)?;
    let alias = plan.generate_alias_name();
    let placeholder = placeholder_for(plan, child, alias)?;
    links.push(ChildLink::Filter(kind, placeholder.clone()));
    *sub = SelectQuery::select_all_from(FromItem::Placeholder(placeholder));
    Ok(())
}

fn placeholder_for(
    plan: &QueryExecutionPlan,
    child: NodeId,
    alias: String,
) -> Result<PlaceholderRef> {
    let table = plan
        .node(child)
        .ok_or(PlanError::UnknownNode(child))?
        .scratch_table
        .clone();
    Ok(PlaceholderRef {
        node: child,
        table,
        alias,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqp_core::query::{BaseTable, BinaryOp, SelectItem};

    fn people() -> FromItem {
        FromItem::table(BaseTable::new("default", "people").with_alias("t"))
    }

    fn avg_by_city() -> SelectQuery {
        SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("avg", vec![Expr::col("t", "age")]),
                "x",
            )],
            vec![people()],
        )
        .with_group_by(vec![Expr::col("t", "city")])
    }

    #[test]
    fn rejects_plain_projection() {
        let q = SelectQuery::new(vec![SelectItem::new(Expr::col("t", "age"))], vec![people()]);
        assert!(matches!(validate(&q), Err(PlanError::NotAggregate)));
    }

    #[test]
    fn rejects_aggregate_subquery_in_select_list() {
        let q = SelectQuery::new(
            vec![
                SelectItem::new(Expr::count_star()),
                SelectItem::new(Expr::scalar_subquery(avg_by_city())),
            ],
            vec![people()],
        );
        assert!(matches!(
            validate(&q),
            Err(PlanError::UnsupportedPosition { clause: "select list" })
        ));
    }

    #[test]
    fn rejects_aggregate_subquery_in_having() {
        let q = SelectQuery::new(vec![SelectItem::new(Expr::count_star())], vec![people()])
            .with_group_by(vec![Expr::col("t", "city")])
            .with_having(Expr::binary(
                BinaryOp::Gt,
                Expr::count_star(),
                Expr::scalar_subquery(avg_by_city()),
            ));
        assert!(matches!(
            validate(&q),
            Err(PlanError::UnsupportedPosition { clause: "HAVING" })
        ));
    }

    #[test]
    fn rejects_dangling_correlation() {
        let q = SelectQuery::new(vec![SelectItem::new(Expr::count_star())], vec![people()])
            .with_filter(Expr::binary(
                BinaryOp::Eq,
                Expr::col("t", "id"),
                Expr::col("nowhere", "id"),
            ));
        match validate(&q) {
            Err(PlanError::CorrelationUnsupported { alias }) => assert_eq!(alias, "nowhere"),
            other => panic!("expected correlation error, got {other:?}"),
        }
    }

    #[test]
    fn failed_validation_consumes_no_identifiers() {
        let mut plan = QueryExecutionPlan::new(
            "scratch",
            std::sync::Arc::new(aqp_core::scramble::ScrambleCatalog::new()),
        );
        let q = SelectQuery::new(vec![SelectItem::new(Expr::col("t", "age"))], vec![people()]);
        assert!(plan.build(&q).is_err());
        assert!(plan.is_empty());
        assert!(plan.root().is_none());
        assert!(plan.generate_unique_identifier().ends_with("_0"));
    }
}
