//! Performance benchmarks for ripple-engine

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ripple_engine::{
    compile, Expr, ObjectSchema, PropertyDescriptor, PropertyType, Query, Schema, Store,
    StoreConfig,
};
use serde_json::json;
use std::sync::Arc;

fn create_test_schema() -> Schema {
    Schema::new(1).with_object(ObjectSchema::new(
        "users",
        "id",
        vec![
            PropertyDescriptor::optional("email", PropertyType::String),
            PropertyDescriptor::optional("age", PropertyType::Int),
        ],
    ))
}

fn populated_store(size: usize) -> Arc<Store> {
    let store = Store::new(create_test_schema(), StoreConfig::default());
    let mut txn = store.begin_write().unwrap();
    for i in 0..size {
        txn.create(
            "users",
            json!({"id": format!("user_{}", i), "age": (i % 90) as i64}),
        )
        .unwrap();
    }
    store.commit(txn).unwrap();
    store
}

fn bench_store_operations(c: &mut Criterion) {
    let mut group = c.benchmark_group("store_operations");

    // Benchmark store creation
    group.bench_function("store_new", |b| {
        b.iter(|| {
            let schema = create_test_schema();
            Store::new(black_box(schema), StoreConfig::default())
        })
    });

    // Benchmark a single-object commit
    group.bench_function("commit_create", |b| {
        let store = Store::new(create_test_schema(), StoreConfig::default());
        let mut id = 0u64;

        b.iter(|| {
            id += 1;
            let mut txn = store.begin_write().unwrap();
            txn.create("users", json!({"id": format!("user_{}", id)}))
                .unwrap();
            store.commit(black_box(txn)).unwrap()
        })
    });

    // Benchmark snapshot reads
    group.bench_function("read_property", |b| {
        let store = populated_store(1000);
        let snapshot = store.snapshot().unwrap();
        let id = ripple_engine::ObjectId::new("users", "user_500");

        b.iter(|| snapshot.read_property(black_box(&id), black_box("age")))
    });

    group.finish();
}

fn bench_copy_on_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_on_write");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("update_one", size), size, |b, &size| {
            let store = populated_store(size);
            let id = ripple_engine::ObjectId::new("users", "user_0");
            let mut age = 0i64;

            b.iter(|| {
                age += 1;
                let mut txn = store.begin_write().unwrap();
                txn.set(&id, "age", json!(age)).unwrap();
                store.commit(txn).unwrap()
            })
        });
    }

    group.finish();
}

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    for size in [100, 1000, 10000].iter() {
        group.bench_with_input(BenchmarkId::new("filter_sort", size), size, |b, &size| {
            let store = populated_store(size);
            let snapshot = store.snapshot().unwrap();
            let query = compile(
                store.schema(),
                &Query::new("users")
                    .filter(Expr::ge("age", 30))
                    .sorted_by("age", false),
            )
            .unwrap();

            b.iter(|| query.evaluate(black_box(&snapshot)))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_store_operations, bench_copy_on_write, bench_query);
criterion_main!(benches);
