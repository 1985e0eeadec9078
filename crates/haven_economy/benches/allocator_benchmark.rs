//! Benchmark for draw and grant throughput.
//!
//! Run with: cargo bench --package haven_economy --bench allocator_benchmark

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use haven_economy::{AccountId, Allocator, GrantKey, InlineSource, Ledger, MemoryStore, PoolStore};
use std::sync::Arc;

fn pool_text(records: usize) -> String {
    (1..=records).map(|i| format!("user{i}@mail.test:secret{i}\n")).collect()
}

fn benchmark_pool_parse(c: &mut Criterion) {
    let text = pool_text(10_000);

    c.bench_function("pool_open_10k_records", |b| {
        b.iter(|| {
            let source = InlineSource(text.clone());
            black_box(PoolStore::open(&source, ":", Arc::new(MemoryStore::new())).unwrap())
        });
    });
}

fn benchmark_allocate(c: &mut Criterion) {
    let text = pool_text(10_000);
    let allocator = Allocator::with_seed(42);

    c.bench_function("allocate_10_from_10k", |b| {
        b.iter_batched(
            || PoolStore::open(&InlineSource(text.clone()), ":", Arc::new(MemoryStore::new())).unwrap().0,
            |pool| black_box(allocator.allocate(&pool, 10).unwrap()),
            BatchSize::LargeInput,
        );
    });
}

fn benchmark_grant(c: &mut Criterion) {
    let ledger = Ledger::new(Arc::new(MemoryStore::new()));
    let alice = AccountId::new("alice").unwrap();
    ledger.open_account(&alice, 0, false, 0).unwrap();

    c.bench_function("grant_new_key", |b| {
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            black_box(ledger.grant(&alice, &GrantKey::streak(i), 50).unwrap())
        });
    });

    let key = GrantKey::quest("1");
    ledger.grant(&alice, &key, 100).unwrap();
    c.bench_function("grant_already_claimed", |b| {
        b.iter(|| black_box(ledger.grant(&alice, &key, 100).unwrap()));
    });
}

criterion_group!(benches, benchmark_pool_parse, benchmark_allocate, benchmark_grant);
criterion_main!(benches);
