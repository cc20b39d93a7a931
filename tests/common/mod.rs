//! Shared fixtures: query builders and a recording backend connection.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use aqp_core::connection::{ConnectionError, DbmsConnection};
use aqp_core::query::{BaseTable, BinaryOp, Expr, FromItem, SelectItem, SelectQuery};
use aqp_core::scramble::{ScrambleCatalog, ScrambleMeta};
use aqp_core::sql::{AnsiSyntax, SqlSyntax};
use aqp_core::types::{QueryResult, Scalar};
use aqp_exec::CancelHandle;

pub fn people() -> FromItem {
    FromItem::table(BaseTable::new("default", "people").with_alias("t"))
}

pub fn people_scr() -> FromItem {
    FromItem::table(BaseTable::new("default", "people_scr").with_alias("s"))
}

pub fn catalog(blocks: u32) -> Arc<ScrambleCatalog> {
    Arc::new(
        ScrambleCatalog::new()
            .with(ScrambleMeta::uniform("default", "people_scr", "blk", blocks).unwrap())
            .unwrap(),
    )
}

pub fn empty_catalog() -> Arc<ScrambleCatalog> {
    Arc::new(ScrambleCatalog::new())
}

/// `SELECT avg(t.age) AS x FROM default.people t GROUP BY t.city [AS alias]`
pub fn avg_age_by_city(from: FromItem, table: &str) -> SelectQuery {
    SelectQuery::new(
        vec![SelectItem::aliased(
            Expr::func("avg", vec![Expr::col(table, "age")]),
            "x",
        )],
        vec![from],
    )
    .with_group_by(vec![Expr::col(table, "city")])
}

/// `SELECT s.x FROM (SELECT avg(t.age) AS x ... GROUP BY t.city) s`
pub fn nested() -> SelectQuery {
    SelectQuery::new(
        vec![SelectItem::new(Expr::col("s", "x"))],
        vec![FromItem::subquery(
            avg_age_by_city(people(), "t").with_alias("s"),
        )],
    )
}

/// `SELECT count(*) FROM people t WHERE EXISTS (SELECT count(*) FROM people u)`
pub fn exists_filter() -> SelectQuery {
    let inner = SelectQuery::new(
        vec![SelectItem::new(Expr::count_star())],
        vec![FromItem::table(
            BaseTable::new("default", "people").with_alias("u"),
        )],
    );
    SelectQuery::new(vec![SelectItem::aliased(Expr::count_star(), "n")], vec![people()])
        .with_filter(Expr::exists(inner))
}

/// Aggregate query nested `depth` derived tables deep.
pub fn nested_depth(depth: usize) -> SelectQuery {
    let mut q = SelectQuery::new(
        vec![SelectItem::aliased(Expr::count_star(), "c")],
        vec![people()],
    )
    .with_group_by(vec![Expr::col("t", "city")]);
    for level in 0..depth {
        let alias = format!("l{level}");
        q = SelectQuery::new(
            vec![SelectItem::aliased(
                Expr::func("sum", vec![Expr::col(alias.clone(), "c")]),
                "c",
            )],
            vec![FromItem::subquery(q.with_alias(alias.clone()))],
        )
        .with_group_by(vec![Expr::col(alias, "c")]);
    }
    q
}

/// `SELECT sum(s.age) AS total, count(*) AS n FROM default.people_scr s`
pub fn sum_over_scramble() -> SelectQuery {
    SelectQuery::new(
        vec![
            SelectItem::aliased(Expr::func("sum", vec![Expr::col("s", "age")]), "total"),
            SelectItem::aliased(Expr::count_star(), "n"),
        ],
        vec![people_scr()],
    )
    .with_filter(Expr::binary(
        BinaryOp::Gt,
        Expr::col("s", "age"),
        Expr::int(18),
    ))
}

/// Records every statement. Statements containing `fail_on` fail; those
/// containing the abort pattern succeed after raising the abort.
pub struct RecordingConnection {
    statements: Mutex<Vec<String>>,
    fail_on: Option<String>,
    abort_on: Option<(String, CancelHandle)>,
    answer: QueryResult,
}

impl RecordingConnection {
    pub fn new() -> Self {
        Self {
            statements: Mutex::new(Vec::new()),
            fail_on: None,
            abort_on: None,
            answer: QueryResult::new(vec!["n".into()], vec![vec![Scalar::I64(42)]]),
        }
    }

    pub fn failing_on(mut self, pattern: &str) -> Self {
        self.fail_on = Some(pattern.to_string());
        self
    }

    pub fn aborting_on(mut self, pattern: &str, handle: CancelHandle) -> Self {
        self.abort_on = Some((pattern.to_string(), handle));
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.contains(needle))
            .count()
    }

    /// Index of the first statement containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.statements().iter().position(|s| s.contains(needle))
    }
}

impl DbmsConnection for RecordingConnection {
    fn execute(&self, sql: &str) -> Result<QueryResult, ConnectionError> {
        self.statements.lock().unwrap().push(sql.to_string());
        if let Some((pattern, handle)) = &self.abort_on {
            if sql.contains(pattern.as_str()) {
                handle.abort();
            }
        }
        if let Some(pattern) = &self.fail_on {
            if sql.contains(pattern.as_str()) {
                return Err(ConnectionError::backend(sql, "injected failure"));
            }
        }
        if sql.starts_with("SELECT") {
            Ok(self.answer.clone())
        } else {
            Ok(QueryResult::empty())
        }
    }

    fn syntax(&self) -> &dyn SqlSyntax {
        &AnsiSyntax
    }
}
