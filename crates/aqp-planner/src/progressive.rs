//! Progressive aggregation over a scrambled table.
//!
//! Increment `k` of `n` evaluates the query over blocks `0..k` of the
//! scramble and scales SUM/COUNT by the inverse of the covered fraction.
//! AVG needs no scaling. The last increment is the unmodified query.
//!
//! Scaling happens on the levels that aggregate the scramble's rows, either
//! directly or through non-aggregating derived tables. An outer level may
//! SUM the scaled SUM/COUNT columns of an aggregated derived table; any other
//! aggregation over pre-aggregated or sub-query-filtered scramble rows has no
//! consistent per-increment estimate and blocks conversion.

use std::collections::{BTreeMap, BTreeSet};

use aqp_core::query::{BaseTable, BinaryOp, Expr, SelectQuery, TableName};
use aqp_core::scramble::{ScrambleCatalog, ScrambleMeta};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};

/// Aggregates that can be recombined from block prefixes.
pub const DECOMPOSABLE_AGGREGATES: &[&str] = &["sum", "count", "avg"];

const SCALED_AGGREGATES: &[&str] = &["sum", "count"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressiveSpec {
    pub scramble: ScrambleMeta,
}

impl ProgressiveSpec {
    pub fn new(scramble: ScrambleMeta) -> Self {
        Self { scramble }
    }

    pub fn total_blocks(&self) -> u32 {
        self.scramble.block_count
    }

    pub fn table(&self) -> TableName {
        self.scramble.name()
    }

    /// The query for increment `k` (`1 <= k <= total_blocks`).
    pub fn increment_query(&self, query: &SelectQuery, k: u32) -> Result<SelectQuery> {
        let n = self.total_blocks();
        if k == 0 || k > n {
            return Err(PlanError::Invariant(format!(
                "increment {k} out of range 1..={n}"
            )));
        }
        if k == n {
            return Ok(query.clone());
        }
        let scale = self.scramble.scale_factor(k).ok_or_else(|| {
            PlanError::Invariant(format!("no coverage for {} blocks of {}", k, self.table()))
        })?;

        let name = self.table();
        let block_column = &self.scramble.block_column;
        let mut q = query.clone();
        q.walk_queries_mut(&mut |level| {
            let refs: Vec<String> = direct_refs(level, &name)
                .into_iter()
                .map(|t| t.reference_name().to_string())
                .collect();
            let reads = reads_rows(level, &name);
            for r in refs {
                level.add_filter(Expr::binary(
                    BinaryOp::Lt,
                    Expr::col(r, block_column.clone()),
                    Expr::int(i64::from(k)),
                ));
            }
            if !reads {
                return;
            }
            let scaled = level
                .select_list
                .iter_mut()
                .map(|s| &mut s.expr)
                .chain(level.having.iter_mut())
                .chain(level.order_by.iter_mut().map(|o| &mut o.expr));
            for expr in scaled {
                expr.rewrite_aggregates(&mut |agg| scale_aggregate(agg, scale));
            }
        });
        Ok(q)
    }
}

fn scale_aggregate(agg: &mut Expr, scale: f64) {
    let Expr::Func { name, .. } = agg else {
        return;
    };
    if !SCALED_AGGREGATES.iter().any(|s| s.eq_ignore_ascii_case(name)) {
        return;
    }
    let call = agg.clone();
    *agg = Expr::binary(BinaryOp::Mul, call, Expr::float(scale));
}

fn direct_refs<'a>(level: &'a SelectQuery, table: &TableName) -> Vec<&'a BaseTable> {
    let mut tables = Vec::new();
    for item in &level.from_list {
        item.direct_tables(&mut tables);
    }
    tables.retain(|t| t.name() == *table);
    tables
}

fn derived_tables(level: &SelectQuery) -> Vec<&SelectQuery> {
    let mut out = Vec::new();
    for item in &level.from_list {
        item.direct_subqueries(&mut out);
    }
    out
}

fn reads_table(query: &SelectQuery, table: &TableName) -> bool {
    query.base_tables().iter().any(|t| t.name() == *table)
}

/// `level` sees raw rows of `table`: from its own from-list or through
/// non-aggregating derived tables.
fn reads_rows(level: &SelectQuery, table: &TableName) -> bool {
    !direct_refs(level, table).is_empty()
        || derived_tables(level)
            .into_iter()
            .any(|d| !d.is_aggregate_level() && reads_rows(d, table))
}

/// Every derived table below `level` that reaches `table` passes its rows
/// through without aggregating.
fn rows_only(level: &SelectQuery, table: &TableName) -> bool {
    derived_tables(level)
        .into_iter()
        .filter(|d| reads_table(d, table))
        .all(|d| !d.is_aggregate_level() && rows_only(d, table))
}

/// Output names of `query` that are plain SUM/COUNT totals.
fn scaled_outputs(query: &SelectQuery) -> BTreeSet<String> {
    query
        .select_list
        .iter()
        .filter(|item| match &item.expr {
            Expr::Func { name, distinct, .. } => {
                !*distinct && SCALED_AGGREGATES.iter().any(|s| s.eq_ignore_ascii_case(name))
            }
            _ => false,
        })
        .filter_map(|item| item.alias.clone())
        .collect()
}

/// Every aggregate at `level` is `sum(alias.col)` over a scaled total.
fn sums_scaled_totals(level: &SelectQuery, totals: &BTreeMap<String, BTreeSet<String>>) -> bool {
    let mut ok = true;
    let exprs = level
        .select_list
        .iter()
        .map(|s| &s.expr)
        .chain(level.having.iter())
        .chain(level.order_by.iter().map(|o| &o.expr));
    for expr in exprs {
        expr.for_each_aggregate(&mut |agg| {
            ok &= match agg {
                Expr::Func {
                    name,
                    args,
                    distinct: false,
                } if name.eq_ignore_ascii_case("sum") => matches!(
                    args.as_slice(),
                    [Expr::Column { table: Some(t), name }]
                        if totals.get(t).is_some_and(|cols| cols.contains(name))
                ),
                _ => false,
            };
        });
    }
    ok
}

fn level_unscalable(level: &SelectQuery, table: &TableName) -> Option<String> {
    let mut conditions = Vec::new();
    for item in &level.from_list {
        item.join_conditions(&mut conditions);
    }
    let mut filtered = false;
    for expr in level.exprs().into_iter().chain(conditions) {
        expr.for_each_subquery(&mut |_, sub| filtered |= reads_table(sub, table));
    }
    if filtered {
        return Some(format!("sub-query over {table} in an expression"));
    }
    if !level.is_aggregate_level() {
        return None;
    }

    let mut totals = BTreeMap::new();
    for d in derived_tables(level) {
        if !reads_table(d, table) {
            continue;
        }
        let pre_aggregated = if d.is_aggregate_level() {
            match &d.alias {
                Some(alias) => {
                    totals.insert(alias.clone(), scaled_outputs(d));
                    false
                }
                None => true,
            }
        } else {
            !rows_only(d, table)
        };
        if pre_aggregated {
            return Some(format!("aggregate over pre-aggregated rows of {table}"));
        }
    }
    if totals.is_empty() {
        return None;
    }
    if reads_rows(level, table) || !sums_scaled_totals(level, &totals) {
        return Some(format!("aggregate over pre-aggregated rows of {table}"));
    }
    None
}

/// Why some increment over `table` would not estimate `query` consistently,
/// if one would not.
pub fn first_unscalable(query: &SelectQuery, table: &TableName) -> Option<String> {
    let mut reason = None;
    query.walk_queries(&mut |level| {
        if reason.is_none() {
            reason = level_unscalable(level, table);
        }
    });
    reason
}

/// First base table, in pre-order, that has a scramble in `catalog`.
pub fn find_progress_table(query: &SelectQuery, catalog: &ScrambleCatalog) -> Option<ScrambleMeta> {
    query
        .base_tables()
        .into_iter()
        .find_map(|t| catalog.get(&t.name()))
        .cloned()
}

/// Name of the first aggregate call (anywhere in the tree) that cannot be
/// recombined from block prefixes. DISTINCT disqualifies any aggregate.
pub fn first_non_decomposable(query: &SelectQuery) -> Option<String> {
    let mut offender = None;
    query.walk_queries(&mut |level| {
        for expr in level.exprs() {
            expr.for_each_aggregate(&mut |agg| {
                if offender.is_some() {
                    return;
                }
                if let Expr::Func { name, distinct, .. } = agg {
                    let decomposable = DECOMPOSABLE_AGGREGATES
                        .iter()
                        .any(|d| d.eq_ignore_ascii_case(name));
                    if !decomposable || *distinct {
                        offender = Some(if *distinct {
                            format!("{} DISTINCT", name.to_ascii_lowercase())
                        } else {
                            name.to_ascii_lowercase()
                        });
                    }
                }
            });
        }
    });
    offender
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqp_core::query::{BaseTable, FromItem, SelectItem};

    fn spec(blocks: u32) -> ProgressiveSpec {
        ProgressiveSpec::new(ScrambleMeta::uniform("default", "people_scr", "blk", blocks).unwrap())
    }

    fn sum_age() -> SelectQuery {
        SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("sum", vec![Expr::col("s", "age")]),
                "a",
            )],
            vec![FromItem::table(
                BaseTable::new("default", "people_scr").with_alias("s"),
            )],
        )
    }

    #[test]
    fn first_increment_filters_and_scales() {
        let q = spec(4).increment_query(&sum_age(), 1).unwrap();
        assert_eq!(
            q.filter,
            Some(Expr::binary(BinaryOp::Lt, Expr::col("s", "blk"), Expr::int(1)))
        );
        assert_eq!(
            q.select_list[0].expr,
            Expr::binary(
                BinaryOp::Mul,
                Expr::func("sum", vec![Expr::col("s", "age")]),
                Expr::float(4.0)
            )
        );
        assert_eq!(q.select_list[0].alias.as_deref(), Some("a"));
    }

    #[test]
    fn last_increment_is_the_original_query() {
        let q = spec(2).increment_query(&sum_age(), 2).unwrap();
        assert_eq!(q, sum_age());
        assert!(spec(2).increment_query(&sum_age(), 0).is_err());
        assert!(spec(2).increment_query(&sum_age(), 3).is_err());
    }

    #[test]
    fn avg_is_not_scaled() {
        let mut q = sum_age();
        q.select_list[0].expr = Expr::func("avg", vec![Expr::col("s", "age")]);
        let inc = spec(2).increment_query(&q, 1).unwrap();
        assert_eq!(inc.select_list[0].expr, q.select_list[0].expr);
        assert!(inc.filter.is_some());
    }

    #[test]
    fn decomposability() {
        assert_eq!(first_non_decomposable(&sum_age()), None);
        let mut q = sum_age();
        q.select_list.push(SelectItem::new(Expr::func("max", vec![Expr::col("s", "age")])));
        assert_eq!(first_non_decomposable(&q).as_deref(), Some("max"));

        let mut q = sum_age();
        q.select_list[0].expr = Expr::Func {
            name: "COUNT".into(),
            args: vec![Expr::col("s", "id")],
            distinct: true,
        };
        assert_eq!(first_non_decomposable(&q).as_deref(), Some("count DISTINCT"));
    }

    #[test]
    fn scaling_follows_rows_through_plain_derived_tables() {
        // SELECT sum(d.age) AS a FROM (SELECT s.age FROM people_scr s) d
        let rows = SelectQuery::new(
            vec![SelectItem::new(Expr::col("s", "age"))],
            vec![FromItem::table(
                BaseTable::new("default", "people_scr").with_alias("s"),
            )],
        )
        .with_alias("d");
        let q = SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("sum", vec![Expr::col("d", "age")]),
                "a",
            )],
            vec![FromItem::subquery(rows)],
        );
        let table = spec(2).table();
        assert_eq!(first_unscalable(&q, &table), None);

        let inc = spec(2).increment_query(&q, 1).unwrap();
        assert!(inc.filter.is_none());
        assert_eq!(
            inc.select_list[0].expr,
            Expr::binary(
                BinaryOp::Mul,
                Expr::func("sum", vec![Expr::col("d", "age")]),
                Expr::float(2.0)
            )
        );
    }

    fn totals_by_city() -> SelectQuery {
        SelectQuery::new(
            vec![
                SelectItem::new(Expr::col("s", "city")),
                SelectItem::aliased(Expr::func("sum", vec![Expr::col("s", "age")]), "total"),
                SelectItem::aliased(Expr::func("avg", vec![Expr::col("s", "age")]), "mean"),
            ],
            vec![FromItem::table(
                BaseTable::new("default", "people_scr").with_alias("s"),
            )],
        )
        .with_group_by(vec![Expr::col("s", "city")])
        .with_alias("x")
    }

    #[test]
    fn outer_sum_of_scaled_totals_is_allowed() {
        let table = spec(2).table();
        let grand = SelectQuery::new(
            vec![SelectItem::new(Expr::func("sum", vec![Expr::col("x", "total")]))],
            vec![FromItem::subquery(totals_by_city())],
        );
        assert_eq!(first_unscalable(&grand, &table), None);
        let inc = spec(2).increment_query(&grand, 1).unwrap();
        assert_eq!(inc.select_list, grand.select_list);

        for expr in [
            Expr::func("sum", vec![Expr::col("x", "mean")]),
            Expr::func("avg", vec![Expr::col("x", "total")]),
            Expr::count_star(),
        ] {
            let q = SelectQuery::new(
                vec![SelectItem::new(expr)],
                vec![FromItem::subquery(totals_by_city())],
            );
            assert_eq!(
                first_unscalable(&q, &table).as_deref(),
                Some("aggregate over pre-aggregated rows of default.people_scr")
            );
        }
    }

    #[test]
    fn progress_table_lookup() {
        let catalog = ScrambleCatalog::new()
            .with(ScrambleMeta::uniform("default", "people_scr", "blk", 2).unwrap())
            .unwrap();
        let meta = find_progress_table(&sum_age(), &catalog).unwrap();
        assert_eq!(meta.table, "people_scr");
        assert!(find_progress_table(&sum_age(), &ScrambleCatalog::new()).is_none());
    }
}
