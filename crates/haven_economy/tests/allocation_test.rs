//! # Allocation Integration Test
//!
//! Proves a record is never handed out twice, whoever asks and however
//! many ask at once.

use haven_economy::{Allocator, HavenError, InlineSource, MemoryStore, PoolStore, RecordIndex};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::{Arc, Barrier};

fn pool_of(records: usize) -> PoolStore {
    let text: String = (1..=records).map(|i| format!("user{i}@mail.test:secret{i}\n")).collect();
    let (pool, report) = PoolStore::open(&InlineSource(text), ":", Arc::new(MemoryStore::new())).unwrap();
    assert_eq!(report.loaded, records);
    pool
}

/// Test: Two concurrent requests for 2 records against a pool of 3.
/// Exactly one wins, the other sees the shortfall.
#[test]
fn test_concurrent_requests_never_overlap() {
    for seed in 0..50 {
        let pool = Arc::new(pool_of(3));
        let allocator = Arc::new(Allocator::with_seed(seed));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let (pool, allocator, barrier) = (Arc::clone(&pool), Arc::clone(&allocator), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    allocator.allocate(&pool, 2)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let wins = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(wins, 1, "seed {seed}: exactly one request may succeed");

        let loss = results.iter().find_map(|r| r.as_ref().err()).unwrap();
        assert_eq!(*loss, HavenError::InsufficientSupply { requested: 2, available: 1 });
        assert_eq!(pool.available_count(), 1);
    }
}

/// Test: Many threads drain the pool. Every record goes out exactly once.
#[test]
fn test_drain_partitions_pool() {
    let pool = Arc::new(pool_of(200));
    let allocator = Arc::new(Allocator::with_seed(7));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let (pool, allocator) = (Arc::clone(&pool), Arc::clone(&allocator));
            std::thread::spawn(move || {
                let mut mine = Vec::new();
                while let Ok(batch) = allocator.allocate(&pool, 3) {
                    mine.extend(batch.into_iter().map(|r| r.index));
                }
                mine
            })
        })
        .collect();

    let mut seen: HashSet<RecordIndex> = HashSet::new();
    for handle in handles {
        for index in handle.join().unwrap() {
            assert!(seen.insert(index), "record {index} allocated twice");
        }
    }

    // 200 = 66 * 3 + 2, the last two never fit a batch of three.
    assert_eq!(seen.len(), 198);
    assert_eq!(pool.available_count(), 2);
    assert!(allocator.allocate(&pool, 2).is_ok());
    assert_eq!(pool.available_count(), 0);
}

/// Test: Consumption survives reopening the pool over the same store.
#[test]
fn test_consumed_set_survives_reopen() {
    let text: String = (1..=5).map(|i| format!("u{i}:p{i}\n")).collect();
    let store = Arc::new(MemoryStore::new());

    let drawn: HashSet<RecordIndex> = {
        let (pool, _) = PoolStore::open(&InlineSource(text.clone()), ":", store.clone()).unwrap();
        Allocator::with_seed(3).allocate(&pool, 3).unwrap().into_iter().map(|r| r.index).collect()
    };

    let (pool, report) = PoolStore::open(&InlineSource(text), ":", store).unwrap();
    assert_eq!(report.restored_consumed, 3);
    let rest = Allocator::with_seed(4).allocate(&pool, 2).unwrap();
    assert!(rest.iter().all(|r| !drawn.contains(&r.index)));
    assert!(matches!(
        Allocator::with_seed(5).allocate(&pool, 1),
        Err(HavenError::InsufficientSupply { requested: 1, available: 0 })
    ));
}

proptest! {
    /// Any sequence of request sizes yields pairwise-disjoint batches, and the
    /// pool only ever shrinks by what was handed out.
    #[test]
    fn prop_batches_are_disjoint(
        records in 1usize..60,
        requests in prop::collection::vec(0i64..8, 1..20),
        seed in any::<u64>(),
    ) {
        let pool = pool_of(records);
        let allocator = Allocator::with_seed(seed);
        let mut seen = HashSet::new();

        for count in requests {
            let before = pool.available_count();
            match allocator.allocate(&pool, count) {
                Ok(batch) => {
                    prop_assert_eq!(batch.len() as i64, count);
                    for record in batch {
                        prop_assert!(seen.insert(record.index));
                        prop_assert!(record.index >= 1 && record.index as usize <= records);
                    }
                    prop_assert_eq!(pool.available_count(), before - count as usize);
                }
                Err(HavenError::InsufficientSupply { requested, available }) => {
                    prop_assert_eq!(requested as i64, count);
                    prop_assert_eq!(available, before);
                    prop_assert_eq!(pool.available_count(), before);
                }
                Err(other) => prop_assert!(false, "unexpected error {other}"),
            }
        }
    }
}
