use std::sync::Arc;

use aqp_core::query::{BaseTable, Expr, FromItem, SelectItem, SelectQuery};
use aqp_core::scramble::{ScrambleCatalog, ScrambleMeta};
use aqp_core::sql::{AnsiSyntax, SqlGenerator};
use aqp_planner::QueryExecutionPlan;
use criterion::{criterion_group, criterion_main, Criterion};

fn nested(depth: usize) -> SelectQuery {
    let mut q = SelectQuery::new(
        vec![SelectItem::aliased(
            Expr::func("sum", vec![Expr::col("s", "age")]),
            "c",
        )],
        vec![FromItem::table(
            BaseTable::new("default", "people_scr").with_alias("s"),
        )],
    )
    .with_group_by(vec![Expr::col("s", "city")]);
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

fn catalog() -> Arc<ScrambleCatalog> {
    Arc::new(
        ScrambleCatalog::new()
            .with(ScrambleMeta::uniform("default", "people_scr", "blk", 16).unwrap())
            .unwrap(),
    )
}

fn bench_build(c: &mut Criterion) {
    let q = nested(16);
    let catalog = catalog();
    c.bench_function("build_depth_16", |b| {
        b.iter(|| QueryExecutionPlan::from_query("aqp_temp", &q, Arc::clone(&catalog)).unwrap())
    });
}

fn bench_compress(c: &mut Criterion) {
    let plan = QueryExecutionPlan::from_query("aqp_temp", &nested(16), catalog()).unwrap();
    c.bench_function("compress_depth_16", |b| {
        b.iter(|| {
            let mut plan = plan.clone();
            plan.compress()
        })
    });
}

fn bench_progressive(c: &mut Criterion) {
    let plan = QueryExecutionPlan::from_query("aqp_temp", &nested(4), catalog()).unwrap();
    c.bench_function("make_progressive_depth_4", |b| {
        b.iter(|| {
            let mut plan = plan.clone();
            plan.make_progressive_if_available().unwrap()
        })
    });

    let mut converted = plan.clone();
    converted.make_progressive_if_available().unwrap();
    let root = converted.root_node().unwrap().clone();
    let spec = root.progressive_spec().unwrap().clone();
    c.bench_function("increment_sql_16_blocks", |b| {
        b.iter(|| {
            for k in 1..=spec.total_blocks() {
                let q = spec.increment_query(&root.query, k).unwrap();
                let _ = SqlGenerator::new(&AnsiSyntax).select(&q).unwrap();
            }
        })
    });
}

fn bench_serialize(c: &mut Criterion) {
    let plan = QueryExecutionPlan::from_query("aqp_temp", &nested(16), catalog()).unwrap();
    c.bench_function("serialize_nodes_json", |b| {
        b.iter(|| {
            for node in plan.nodes() {
                let _ = serde_json::to_vec(node).unwrap();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_build,
    bench_compress,
    bench_progressive,
    bench_serialize
);
criterion_main!(benches);
