//! # Allocator
//!
//! **Uniform draws without replacement from the shared pool.**
//!
//! ```text
//! allocate(count) ->
//!   1. Lock the pool
//!   2. Re-derive the available set (never cached between calls)
//!   3. Sample distinct positions in the available set
//!   4. Persist the new consumed set
//!   5. Commit in memory, unlock, return records
//! ```
//!
//! A record is spent the instant it is drawn. If the caller crashes after
//! `allocate` returns, the records stay consumed.

use crate::error::{HavenError, HavenResult};
use crate::pool::{PoolStore, Record, RecordIndex};
use parking_lot::Mutex;
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// Draws distinct, unconsumed records from a [`PoolStore`].
pub struct Allocator {
    rng: Mutex<ChaCha20Rng>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Creates an allocator seeded from OS entropy.
    #[must_use]
    pub fn new() -> Self {
        Self { rng: Mutex::new(ChaCha20Rng::from_entropy()) }
    }

    /// Creates a deterministic allocator. Tests and replays only.
    #[must_use]
    pub fn with_seed(seed: u64) -> Self {
        Self { rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)) }
    }

    /// Draws `count` distinct records and marks them consumed.
    ///
    /// Each available index has equal probability of selection within one
    /// call. Returned order carries no meaning.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] if `count` is negative.
    /// - [`HavenError::InsufficientSupply`] if fewer than `count` records remain.
    ///   Nothing is consumed.
    /// - [`HavenError::PersistenceUnavailable`] if the consumed set could not be
    ///   written. Nothing is consumed.
    pub fn allocate(&self, pool: &PoolStore, count: i64) -> HavenResult<Vec<Record>> {
        let count = usize::try_from(count)
            .map_err(|_| HavenError::invalid(format!("allocation count must be non-negative, got {count}")))?;
        if count == 0 {
            return Ok(Vec::new());
        }

        let mut guard = pool.lock();

        let available: Vec<RecordIndex> = guard.available_indices().into_iter().collect();
        if available.len() < count {
            return Err(HavenError::InsufficientSupply {
                requested: count,
                available: available.len(),
            });
        }

        let chosen: Vec<RecordIndex> = {
            let mut rng = self.rng.lock();
            index::sample(&mut *rng, available.len(), count)
                .into_iter()
                .map(|i| available[i])
                .collect()
        };

        guard.mark_consumed(&chosen)?;

        let records = chosen
            .iter()
            .filter_map(|&index| guard.record(index).cloned())
            .collect::<Vec<_>>();

        tracing::debug!(count, "allocated records");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InlineSource;
    use crate::store::{FlakyStore, KeyValueStore, MemoryStore};
    use std::collections::HashSet;
    use std::sync::Arc;

    fn pool_of(n: usize) -> PoolStore {
        let text: String = (0..n).map(|i| format!("user{i}:secret{i}\n")).collect();
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        PoolStore::open(&InlineSource(text), ":", store).unwrap().0
    }

    #[test]
    fn test_allocate_returns_distinct_records() {
        let pool = pool_of(10);
        let allocator = Allocator::with_seed(7);

        let batch = allocator.allocate(&pool, 4).unwrap();
        assert_eq!(batch.len(), 4);
        let unique: HashSet<_> = batch.iter().map(|r| r.index).collect();
        assert_eq!(unique.len(), 4);
        assert_eq!(pool.available_count(), 6);
    }

    #[test]
    fn test_zero_count_has_no_side_effects() {
        let pool = pool_of(3);
        let allocator = Allocator::with_seed(1);
        assert!(allocator.allocate(&pool, 0).unwrap().is_empty());
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn test_negative_count_is_invalid() {
        let pool = pool_of(3);
        let allocator = Allocator::with_seed(1);
        let err = allocator.allocate(&pool, -1).unwrap_err();
        assert!(matches!(err, HavenError::InvalidRequest(_)));
    }

    #[test]
    fn test_insufficient_supply_consumes_nothing() {
        let pool = pool_of(3);
        let allocator = Allocator::with_seed(1);
        let err = allocator.allocate(&pool, 4).unwrap_err();
        assert_eq!(err, HavenError::InsufficientSupply { requested: 4, available: 3 });
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn test_exhaust_pool_exactly() {
        let pool = pool_of(5);
        let allocator = Allocator::with_seed(3);

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let batch = allocator.allocate(&pool, 1).unwrap();
            assert!(seen.insert(batch[0].index));
        }
        assert!(matches!(
            allocator.allocate(&pool, 1),
            Err(HavenError::InsufficientSupply { requested: 1, available: 0 })
        ));
    }

    #[test]
    fn test_persist_failure_keeps_records_available() {
        let flaky = Arc::new(FlakyStore::new(MemoryStore::new()));
        let store: Arc<dyn KeyValueStore> = flaky.clone();
        let text = "a:1\nb:2\nc:3\n".to_string();
        let (pool, _) = PoolStore::open(&InlineSource(text), ":", store).unwrap();
        let allocator = Allocator::with_seed(9);

        flaky.set_fail_writes(true);
        assert!(allocator.allocate(&pool, 2).unwrap_err().is_retryable());
        assert_eq!(pool.available_count(), 3);
    }

    #[test]
    fn test_selection_is_roughly_uniform() {
        // 10 records, draw 1 from a fresh pool many times.
        let allocator = Allocator::with_seed(42);
        let mut hits = [0u32; 10];
        for _ in 0..5000 {
            let pool = pool_of(10);
            let batch = allocator.allocate(&pool, 1).unwrap();
            hits[(batch[0].index - 1) as usize] += 1;
        }
        // Expected 500 each; allow wide slack.
        for (i, &h) in hits.iter().enumerate() {
            assert!((350..=650).contains(&h), "index {} drawn {} times", i + 1, h);
        }
    }
}
