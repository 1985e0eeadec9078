//! # Activity History
//!
//! Per-account, append-only, most-recent-first, bounded.
//!
//! Display and audit only. Correctness never depends on it: a failed write is
//! logged and the in-memory log still updates.

use crate::account::AccountId;
use crate::error::HavenResult;
use crate::pool::Record;
use crate::store::{load_json, save_json, KeyValueStore};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// The records returned by one gacha pull.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationBatch {
    /// Tier pulled.
    pub tier: String,
    /// Coins paid.
    pub cost: u64,
    /// Records drawn.
    pub records: Vec<Record>,
}

/// Something worth showing on the dashboard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryEvent {
    /// A gacha pull.
    Allocation(AllocationBatch),
    /// A redeemed token.
    TokenRedeemed {
        /// Token string.
        code: String,
        /// Coins paid.
        amount: u64,
    },
}

/// One history line.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Unix seconds.
    pub at: u64,
    /// What happened.
    pub event: HistoryEvent,
}

/// Bounded activity logs for every account.
pub struct History {
    store: Arc<dyn KeyValueStore>,
    limit: usize,
    logs: Mutex<HashMap<AccountId, VecDeque<HistoryEntry>>>,
}

impl History {
    /// Creates a history keeping `limit` entries per account.
    pub fn new(store: Arc<dyn KeyValueStore>, limit: usize) -> Self {
        Self {
            store,
            limit: limit.max(1),
            logs: Mutex::new(HashMap::new()),
        }
    }

    fn store_key(account: &AccountId) -> String {
        format!("history:{account}")
    }

    /// Prepends an entry, dropping the oldest beyond the limit.
    pub fn append(&self, account: &AccountId, entry: HistoryEntry) {
        let mut logs = self.logs.lock();
        let log = logs.entry(account.clone()).or_insert_with(|| {
            self.load(account).unwrap_or_else(|err| {
                tracing::warn!(account = %account, "history unreadable, starting fresh: {err}");
                VecDeque::new()
            })
        });

        log.push_front(entry);
        log.truncate(self.limit);

        let snapshot: Vec<&HistoryEntry> = log.iter().collect();
        if let Err(err) = save_json(self.store.as_ref(), &Self::store_key(account), &snapshot) {
            tracing::warn!(account = %account, "history not persisted: {err}");
        }
    }

    /// All retained entries, most recent first.
    ///
    /// # Errors
    ///
    /// Returns [`crate::HavenError::PersistenceUnavailable`] if a log not yet
    /// cached cannot be read.
    pub fn recent(&self, account: &AccountId) -> HavenResult<Vec<HistoryEntry>> {
        let mut logs = self.logs.lock();
        if let Some(log) = logs.get(account) {
            return Ok(log.iter().cloned().collect());
        }
        let loaded = self.load(account)?;
        let out = loaded.iter().cloned().collect();
        logs.insert(account.clone(), loaded);
        Ok(out)
    }

    /// Retained gacha pulls, most recent first.
    ///
    /// # Errors
    ///
    /// See [`History::recent`].
    pub fn recent_allocations(&self, account: &AccountId) -> HavenResult<Vec<(u64, AllocationBatch)>> {
        Ok(self
            .recent(account)?
            .into_iter()
            .filter_map(|entry| match entry.event {
                HistoryEvent::Allocation(batch) => Some((entry.at, batch)),
                HistoryEvent::TokenRedeemed { .. } => None,
            })
            .collect())
    }

    /// Retained token redemptions as `(at, code, amount)`, most recent first.
    ///
    /// # Errors
    ///
    /// See [`History::recent`].
    pub fn recent_redemptions(&self, account: &AccountId) -> HavenResult<Vec<(u64, String, u64)>> {
        Ok(self
            .recent(account)?
            .into_iter()
            .filter_map(|entry| match entry.event {
                HistoryEvent::TokenRedeemed { code, amount } => Some((entry.at, code, amount)),
                HistoryEvent::Allocation(_) => None,
            })
            .collect())
    }

    fn load(&self, account: &AccountId) -> HavenResult<VecDeque<HistoryEntry>> {
        let mut entries = load_json::<VecDeque<HistoryEntry>>(self.store.as_ref(), &Self::store_key(account))?
            .unwrap_or_default();
        entries.truncate(self.limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{FlakyStore, MemoryStore};

    fn alice() -> AccountId {
        AccountId::new("alice").unwrap()
    }

    fn redeemed(at: u64) -> HistoryEntry {
        HistoryEntry {
            at,
            event: HistoryEvent::TokenRedeemed { code: format!("CODE{at:04}"), amount: at },
        }
    }

    #[test]
    fn test_most_recent_first_and_bounded() {
        let history = History::new(Arc::new(MemoryStore::new()), 3);
        for at in 1..=5 {
            history.append(&alice(), redeemed(at));
        }
        let ats: Vec<u64> = history.recent(&alice()).unwrap().iter().map(|e| e.at).collect();
        assert_eq!(ats, vec![5, 4, 3]);
    }

    #[test]
    fn test_history_reloads_from_store() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        History::new(Arc::clone(&store), 10).append(&alice(), redeemed(1));

        let history = History::new(store, 10);
        assert_eq!(history.recent_redemptions(&alice()).unwrap(), vec![(1, "CODE0001".to_string(), 1)]);
        assert!(history.recent_allocations(&alice()).unwrap().is_empty());
    }

    #[test]
    fn test_persist_failure_is_not_fatal() {
        let flaky = Arc::new(FlakyStore::new(MemoryStore::new()));
        flaky.set_fail_writes(true);
        let history = History::new(flaky.clone(), 10);
        history.append(&alice(), redeemed(1));
        assert_eq!(history.recent(&alice()).unwrap().len(), 1);
    }
}
