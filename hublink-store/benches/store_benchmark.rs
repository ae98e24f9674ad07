use criterion::{criterion_group, criterion_main, Criterion};
use hublink_store::{DeviceStore, Direction, OperationStatus, StoreConfig};
use serde_json::json;
use std::hint::black_box;

fn bench_add_operation(c: &mut Criterion) {
    let store = DeviceStore::with_defaults();
    store.register_device("bench", None);

    c.bench_function("add_operation", |b| {
        b.iter(|| {
            black_box(store.add_operation(
                black_box("bench"),
                "command",
                "ON",
                Some(json!({"pin": 13})),
                OperationStatus::Pending,
            ));
        })
    });
}

fn bench_capped_interactions(c: &mut Criterion) {
    let store = DeviceStore::new(StoreConfig { max_history: Some(1000) });

    c.bench_function("add_interaction_capped_1k", |b| {
        b.iter(|| {
            black_box(store.add_interaction(
                "bench",
                "message",
                Direction::Outbound,
                json!({"type": "ping"}),
            ));
        })
    });
}

fn bench_tail_slice(c: &mut Criterion) {
    let store = DeviceStore::with_defaults();
    for i in 0..10_000 {
        store.add_operation("bench", "command", &format!("op{i}"), None, OperationStatus::Pending);
    }

    c.bench_function("get_operations_last_50_of_10k", |b| {
        b.iter(|| black_box(store.get_operations(black_box("bench"), Some(50))))
    });
}

criterion_group!(benches, bench_add_operation, bench_capped_interactions, bench_tail_slice);
criterion_main!(benches);
