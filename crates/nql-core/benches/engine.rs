//! Compile and in-memory execution benchmarks.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nql_core::proto::{Query, QueryRequest, SortSpec};
use nql_core::{BucketDef, Catalog, EngineConfig, ExecutionContext, MemoryRunner, QueryEngine};
use serde_json::json;

fn setup(shapes: usize, config: EngineConfig) -> QueryEngine {
    let catalog = Arc::new(Catalog::new());
    let sql = Arc::new(MemoryRunner::new("sql"));
    let kv = Arc::new(MemoryRunner::new("kv"));

    sql.extend(
        "shape",
        (0..shapes).map(|i| {
            json!({
                "id": i,
                "name": format!("Shape {}", i),
                "size": i % 100,
                "color_id": i % 16,
            })
        }),
    )
    .unwrap();
    kv.extend(
        "color",
        (0..16).map(|i| json!({"id": i, "name": format!("Color {}", i), "warm": i % 2 == 0})),
    )
    .unwrap();

    catalog.register(BucketDef::new("shape"), sql);
    catalog.register(BucketDef::new("color"), kv);
    QueryEngine::with_config(catalog, config)
}

fn federated_query() -> Query {
    Query::from_value(json!({
        "size >=": 50,
        "color_id in": {"@color.id": {"warm": true}},
        "or name ~contains": "shape 1",
    }))
    .unwrap()
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile");
    let query = federated_query();

    let cached = setup(0, EngineConfig::default());
    group.bench_function("cached", |b| {
        b.iter(|| black_box(cached.compile("shape", &query).unwrap()));
    });

    let uncached = setup(0, EngineConfig::new().without_plan_cache());
    group.bench_function("uncached", |b| {
        b.iter(|| black_box(uncached.compile("shape", &query).unwrap()));
    });

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("execute");

    for shapes in [100, 1_000, 10_000] {
        let engine = setup(shapes, EngineConfig::default());
        let request = QueryRequest::new("shape", federated_query())
            .with_sort(SortSpec::desc("size"));

        group.bench_with_input(BenchmarkId::new("federated", shapes), &shapes, |b, _| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    engine
                        .execute(&ExecutionContext::new(), &request)
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

fn bench_parameterized(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("parameterized");
    let params: Vec<_> = (0..256).map(|i| json!({"shape_id": i})).collect();

    for coalesce in [true, false] {
        let engine = setup(1_000, EngineConfig::new().coalesce_params(coalesce));
        let request = QueryRequest::new(
            "shape",
            Query::from_value(json!({"id": {".": "shape_id"}})).unwrap(),
        )
        .with_params(params.clone());

        let name = if coalesce { "coalesced" } else { "per_row" };
        group.bench_function(name, |b| {
            b.to_async(&rt).iter(|| async {
                black_box(
                    engine
                        .execute(&ExecutionContext::new(), &request)
                        .await
                        .unwrap(),
                )
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute, bench_parameterized);
criterion_main!(benches);
