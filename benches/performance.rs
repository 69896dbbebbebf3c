use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use idempotency_coordinator::idempotency::{
    CoordinatorConfig, IdempotencyCoordinator, IdempotencyKeyGenerator, IdempotencyRecord,
    InMemoryIdempotencyStore, RequestFingerprinter,
};
use idempotency_coordinator::observability::mask_sensitive;

fn payload(items: usize) -> Value {
    let lines: Vec<Value> = (0..items)
        .map(|i| json!({ "sku": format!("SKU-{}", i), "quantity": i % 5 + 1, "price": 1999 }))
        .collect();
    json!({
        "customer": "cus_123",
        "currency": "USD",
        "request_id": "req-volatile",
        "timestamp": "2026-01-01T00:00:00Z",
        "lines": lines,
    })
}

fn benchmark_fingerprinting(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let fingerprinter = RequestFingerprinter::default();

    for size in [1, 10, 100].iter() {
        let request = payload(*size);
        group.bench_with_input(BenchmarkId::new("request", size), &request, |b, request| {
            b.iter(|| fingerprinter.fingerprint(black_box(request)))
        });
    }

    group.finish();
}

fn benchmark_key_generation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_generation");
    let generator = IdempotencyKeyGenerator::with_default_config();

    group.bench_function("from_client_key", |b| {
        b.iter(|| generator.from_client_key(black_box("  order-42  ")))
    });

    group.bench_function("derive", |b| {
        let inputs = json!({ "account": "acc_1", "amount": 100 });
        b.iter(|| generator.derive(black_box("charges"), black_box(&inputs)))
    });

    group.finish();
}

fn benchmark_record_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("record");

    group.bench_function("claim", |b| {
        b.iter(|| IdempotencyRecord::claim(black_box("order-42"), "fp", Duration::from_secs(60)))
    });

    group.bench_function("mask_key", |b| {
        b.iter(|| mask_sensitive(black_box("order-42-customer-123"), 4))
    });

    group.finish();
}

fn benchmark_coordinator(c: &mut Criterion) {
    let mut group = c.benchmark_group("coordinator");
    group.measurement_time(Duration::from_secs(10));
    let runtime = Runtime::new().unwrap();

    let coordinator = Arc::new(IdempotencyCoordinator::new(
        Arc::new(InMemoryIdempotencyStore::new()),
        CoordinatorConfig::default(),
    ));

    // Seed one completed key so every iteration takes the replay path.
    runtime
        .block_on(coordinator.execute("bench-replay", "fp", Duration::from_secs(3600), || async {
            Ok(json!({ "chargeId": "ch_bench" }))
        }))
        .unwrap();

    group.bench_function("replay", |b| {
        b.to_async(&runtime).iter(|| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let value: Value = coordinator
                    .execute("bench-replay", "fp", Duration::from_secs(3600), || async {
                        Ok(Value::Null)
                    })
                    .await
                    .unwrap();
                black_box(value)
            }
        })
    });

    group.bench_function("execute_fresh_key", |b| {
        b.to_async(&runtime).iter(|| {
            let coordinator = Arc::clone(&coordinator);
            async move {
                let key = uuid::Uuid::new_v4().to_string();
                let value: u64 = coordinator
                    .execute(&key, "fp", Duration::from_secs(60), || async { Ok(42u64) })
                    .await
                    .unwrap();
                black_box(value)
            }
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_fingerprinting,
    benchmark_key_generation,
    benchmark_record_lifecycle,
    benchmark_coordinator,
);
criterion_main!(benches);
