//! # Pool Store
//!
//! The finite, ordered collection of credential records and the set of
//! indices already handed out.
//!
//! Records are never removed. Consumption is tracked in a separate set so the
//! pool's size and ordering stay stable for auditing. A consumed index is
//! never reassigned.
//!
//! ## Source Format
//!
//! ```text
//! identifier<SEP>secret
//! identifier<SEP>secret
//! ```
//!
//! `index` is the 1-based line number. Malformed lines, including lines that
//! are not valid UTF-8, are skipped with a warning and reported. Blank lines
//! are ignored.

use crate::error::{HavenError, HavenResult};
use crate::store::{load_json, save_json, KeyValueStore};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Store key for the consumed index set.
pub const CONSUMED_KEY: &str = "pool:consumed";

/// Position of a record in the pool source (1-based line number).
pub type RecordIndex = u32;

/// One allocatable credential record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Line number in the pool source.
    pub index: RecordIndex,
    /// Login identifier (username or email).
    pub identifier: String,
    /// Secret paired with the identifier.
    pub secret: String,
}

impl Record {
    /// Parses one source line. Returns `Ok(None)` for blank lines.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::MalformedRecord`] when the delimiter is missing or
    /// either field is empty.
    pub fn parse_line(line: &str, index: RecordIndex, delimiter: &str) -> HavenResult<Option<Self>> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }

        let Some((identifier, secret)) = line.split_once(delimiter) else {
            return Err(HavenError::MalformedRecord {
                line: index,
                reason: format!("missing delimiter {delimiter:?}"),
            });
        };

        let identifier = identifier.trim();
        let secret = secret.trim();
        if identifier.is_empty() {
            return Err(HavenError::MalformedRecord { line: index, reason: "empty identifier".to_string() });
        }
        if secret.is_empty() {
            return Err(HavenError::MalformedRecord { line: index, reason: "empty secret".to_string() });
        }

        Ok(Some(Self {
            index,
            identifier: identifier.to_string(),
            secret: secret.to_string(),
        }))
    }
}

/// Outcome of parsing a pool source.
#[derive(Clone, Debug, Default)]
pub struct LoadReport {
    /// Records accepted.
    pub loaded: usize,
    /// Lines rejected, each as a [`HavenError::MalformedRecord`].
    pub skipped: Vec<HavenError>,
    /// Consumed indices restored from the store.
    pub restored_consumed: usize,
}

// ============================================================================
// Pool sources
// ============================================================================

/// Where the pool text comes from. Fetched once at startup.
///
/// Sources hand back raw bytes. Decoding happens per line so one bad line
/// cannot sink the whole load.
pub trait PoolSource {
    /// Returns the full newline-delimited pool contents.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidConfig`] if the source cannot be read.
    fn fetch(&self) -> HavenResult<Vec<u8>>;
}

/// Pool text read from a local file.
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Creates a source for `path`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl PoolSource for FileSource {
    fn fetch(&self) -> HavenResult<Vec<u8>> {
        std::fs::read(&self.path)
            .map_err(|e| HavenError::InvalidConfig(format!("read pool source {}: {e}", self.path.display())))
    }
}

/// Pool text held in memory.
pub struct InlineSource(pub String);

impl PoolSource for InlineSource {
    fn fetch(&self) -> HavenResult<Vec<u8>> {
        Ok(self.0.clone().into_bytes())
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Records plus consumed indices. Pure data, no persistence.
#[derive(Clone, Debug, Default)]
pub struct Pool {
    records: Vec<Record>,
    positions: HashMap<RecordIndex, usize>,
    consumed: BTreeSet<RecordIndex>,
}

impl Pool {
    /// Parses pool contents. Malformed lines are logged, skipped, and reported.
    pub fn parse(contents: impl AsRef<[u8]>, delimiter: &str) -> (Self, LoadReport) {
        let mut pool = Self::default();
        let mut report = LoadReport::default();

        for (offset, raw) in contents.as_ref().split(|&b| b == b'\n').enumerate() {
            let Ok(index) = RecordIndex::try_from(offset + 1) else {
                tracing::warn!("pool source exceeds {} lines, truncating", RecordIndex::MAX);
                break;
            };
            let parsed = std::str::from_utf8(raw)
                .map_err(|e| HavenError::MalformedRecord {
                    line: index,
                    reason: format!("not valid UTF-8: {e}"),
                })
                .and_then(|line| Record::parse_line(line, index, delimiter));
            match parsed {
                Ok(Some(record)) => {
                    pool.positions.insert(index, pool.records.len());
                    pool.records.push(record);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(line = index, "skipping pool line: {err}");
                    report.skipped.push(err);
                }
            }
        }

        report.loaded = pool.records.len();
        (pool, report)
    }

    /// Total records, consumed or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if the pool holds no records at all.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Looks up a record by index.
    pub fn record(&self, index: RecordIndex) -> Option<&Record> {
        self.positions.get(&index).map(|&pos| &self.records[pos])
    }

    /// Returns true if `index` was already handed out.
    pub fn is_consumed(&self, index: RecordIndex) -> bool {
        self.consumed.contains(&index)
    }

    /// All indices not yet consumed, in pool order.
    pub fn available_indices(&self) -> BTreeSet<RecordIndex> {
        self.records
            .iter()
            .map(|r| r.index)
            .filter(|i| !self.consumed.contains(i))
            .collect()
    }

    /// Number of records still available.
    pub fn available_count(&self) -> usize {
        self.records.len() - self.consumed.len()
    }

    /// Number of records already handed out.
    pub fn consumed_count(&self) -> usize {
        self.consumed.len()
    }

    /// The consumed set as it would be after consuming `indices`.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] for an index that is not in the pool.
    pub fn consumed_with(&self, indices: &[RecordIndex]) -> HavenResult<BTreeSet<RecordIndex>> {
        let mut next = self.consumed.clone();
        for &index in indices {
            if !self.positions.contains_key(&index) {
                return Err(HavenError::invalid(format!("record index {index} is not in the pool")));
            }
            next.insert(index);
        }
        Ok(next)
    }

    /// Idempotent union into the consumed set. Returns how many were new.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::InvalidRequest`] for an index that is not in the pool.
    /// Nothing is consumed in that case.
    pub fn mark_consumed(&mut self, indices: &[RecordIndex]) -> HavenResult<usize> {
        let next = self.consumed_with(indices)?;
        let added = next.len() - self.consumed.len();
        self.consumed = next;
        Ok(added)
    }

    /// Restores a persisted consumed set. Unknown indices are dropped.
    fn restore_consumed(&mut self, persisted: Vec<RecordIndex>) -> usize {
        let mut unknown = 0usize;
        for index in persisted {
            if self.positions.contains_key(&index) {
                self.consumed.insert(index);
            } else {
                unknown += 1;
            }
        }
        if unknown > 0 {
            tracing::warn!(unknown, "persisted consumed indices not present in pool source");
        }
        self.consumed.len()
    }
}

// ============================================================================
// Pool store
// ============================================================================

/// The process-wide pool with durable consumption tracking.
///
/// One mutex covers the whole pool. Anything that reads the available set
/// and then consumes from it must do both under [`PoolStore::lock`].
pub struct PoolStore {
    pool: Mutex<Pool>,
    store: Arc<dyn KeyValueStore>,
}

impl PoolStore {
    /// Fetches the source, parses it, and restores the consumed set.
    ///
    /// # Errors
    ///
    /// Returns an error if the source cannot be fetched or the store cannot be read.
    /// Malformed lines are never fatal.
    pub fn open(
        source: &dyn PoolSource,
        delimiter: &str,
        store: Arc<dyn KeyValueStore>,
    ) -> HavenResult<(Self, LoadReport)> {
        if delimiter.is_empty() {
            return Err(HavenError::InvalidConfig("pool delimiter must not be empty".to_string()));
        }

        let contents = source.fetch()?;
        let (mut pool, mut report) = Pool::parse(&contents, delimiter);

        if let Some(persisted) = load_json::<Vec<RecordIndex>>(store.as_ref(), CONSUMED_KEY)? {
            report.restored_consumed = pool.restore_consumed(persisted);
        }

        tracing::info!(
            loaded = report.loaded,
            skipped = report.skipped.len(),
            consumed = report.restored_consumed,
            "pool loaded"
        );

        Ok((Self { pool: Mutex::new(pool), store }, report))
    }

    /// Locks the pool for a read-then-consume sequence.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self.pool.lock(),
            store: self.store.as_ref(),
        }
    }

    /// All indices not yet consumed.
    pub fn available_indices(&self) -> BTreeSet<RecordIndex> {
        self.pool.lock().available_indices()
    }

    /// Durably consumes `indices`. Already-consumed indices are a no-op.
    ///
    /// # Errors
    ///
    /// See [`PoolGuard::mark_consumed`].
    pub fn mark_consumed(&self, indices: &[RecordIndex]) -> HavenResult<usize> {
        self.lock().mark_consumed(indices)
    }

    /// Total records in the pool.
    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    /// Returns true if the pool holds no records.
    pub fn is_empty(&self) -> bool {
        self.pool.lock().is_empty()
    }

    /// Records still available.
    pub fn available_count(&self) -> usize {
        self.pool.lock().available_count()
    }

    /// Records already handed out.
    pub fn consumed_count(&self) -> usize {
        self.pool.lock().consumed_count()
    }
}

/// Exclusive access to the pool.
pub struct PoolGuard<'a> {
    pool: MutexGuard<'a, Pool>,
    store: &'a dyn KeyValueStore,
}

impl PoolGuard<'_> {
    /// All indices not yet consumed.
    pub fn available_indices(&self) -> BTreeSet<RecordIndex> {
        self.pool.available_indices()
    }

    /// Looks up a record by index.
    pub fn record(&self, index: RecordIndex) -> Option<&Record> {
        self.pool.record(index)
    }

    /// Persists the new consumed set, then applies it in memory.
    ///
    /// # Errors
    ///
    /// - [`HavenError::InvalidRequest`] for an index not in the pool.
    /// - [`HavenError::PersistenceUnavailable`] if the write fails. Memory is
    ///   left untouched so the indices stay available.
    pub fn mark_consumed(&mut self, indices: &[RecordIndex]) -> HavenResult<usize> {
        let next = self.pool.consumed_with(indices)?;
        let added = next.len() - self.pool.consumed_count();
        if added == 0 {
            return Ok(0);
        }

        let persisted: Vec<RecordIndex> = next.iter().copied().collect();
        save_json(self.store, CONSUMED_KEY, &persisted)?;

        self.pool.mark_consumed(indices)?;
        Ok(added)
    }
}
