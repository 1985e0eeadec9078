//! # Durable Key-Value Store
//!
//! **The persistence boundary.**
//!
//! The economy never assumes multi-key transactions. Each `put` is
//! crash-consistent on its own: after it returns, a reader sees either the
//! old value or the new one, never a torn write. Everything above this layer
//! (ledger, pool) is built so one logical mutation is one `put`, and the
//! in-memory state is only changed after that `put` succeeded.
//!
//! ## File Format
//!
//! ```text
//! [4 bytes: magic "HKV1"]
//! [4 bytes: version]
//! [4 bytes: payload length]
//! [N bytes: payload]
//! [4 bytes: CRC32 of above]
//! ```
//!
//! Files are written to a sibling `.tmp`, synced, then renamed over the
//! target.
//!
//! A data directory belongs to one process at a time. [`FileStore::open`]
//! takes an exclusive lock on `LOCK` and holds it until the store is dropped.

use crate::error::{HavenError, HavenResult};
use fs4::FileExt;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Magic bytes identifying a value file.
const FRAME_MAGIC: &[u8; 4] = b"HKV1";

/// Current frame format version.
const FRAME_VERSION: u32 = 1;

/// Header size: magic + version + length.
const HEADER_LEN: usize = 12;

/// Lock file guarding a data directory against a second process.
const LOCK_FILE: &str = "LOCK";

/// A durable key-value store with atomic per-key writes.
pub trait KeyValueStore: Send + Sync {
    /// Reads the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the store cannot be read.
    fn get(&self, key: &str) -> HavenResult<Option<Vec<u8>>>;

    /// Replaces the value stored under `key`.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the write did not land.
    /// The previous value is then still in place.
    fn put(&self, key: &str, value: &[u8]) -> HavenResult<()>;
}

/// Reads and decodes a JSON value.
///
/// # Errors
///
/// Store failures and undecodable bytes are both reported as
/// [`HavenError::PersistenceUnavailable`].
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> HavenResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| HavenError::PersistenceUnavailable(format!("corrupt value at {key}: {e}"))),
        None => Ok(None),
    }
}

/// Encodes and writes a JSON value.
///
/// # Errors
///
/// Returns [`HavenError::PersistenceUnavailable`] if encoding or the write fails.
pub fn save_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> HavenResult<()> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| HavenError::PersistenceUnavailable(format!("encode {key}: {e}")))?;
    store.put(key, &bytes)
}

// ============================================================================
// In-memory store
// ============================================================================

/// Volatile store for tests and single-process demos.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys written so far.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> HavenResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> HavenResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

// ============================================================================
// File store
// ============================================================================

/// One file per key inside a data directory.
pub struct FileStore {
    root: PathBuf,
    /// Exclusive lock on the directory, released on drop.
    _lock: File,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns [`HavenError::PersistenceUnavailable`] if the directory cannot be
    /// created or another store already holds it.
    pub fn open(root: impl AsRef<Path>) -> HavenResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| HavenError::PersistenceUnavailable(format!("create {}: {e}", root.display())))?;

        let lock_path = root.join(LOCK_FILE);
        let lock = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .map_err(|e| HavenError::PersistenceUnavailable(format!("open {}: {e}", lock_path.display())))?;
        lock.try_lock_exclusive().map_err(|e| {
            HavenError::PersistenceUnavailable(format!("{} is in use by another process: {e}", root.display()))
        })?;

        Ok(Self { root, _lock: lock })
    }

    /// Directory holding the value files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Keys contain `:` and user-supplied ids, so file names are hex-encoded.
    fn path_for(&self, key: &str) -> PathBuf {
        let mut name = String::with_capacity(key.len() * 2 + 4);
        for byte in key.as_bytes() {
            let _ = write!(name, "{byte:02x}");
        }
        name.push_str(".kv");
        self.root.join(name)
    }

    fn encode_frame(payload: &[u8]) -> HavenResult<Vec<u8>> {
        let len = u32::try_from(payload.len())
            .map_err(|_| HavenError::PersistenceUnavailable("value too large".to_string()))?;

        let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + 4);
        frame.extend_from_slice(FRAME_MAGIC);
        frame.extend_from_slice(&FRAME_VERSION.to_le_bytes());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(payload);
        let crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&crc.to_le_bytes());
        Ok(frame)
    }

    fn decode_frame(key: &str, frame: &[u8]) -> HavenResult<Vec<u8>> {
        let corrupt = |reason: &str| HavenError::PersistenceUnavailable(format!("corrupt frame for {key}: {reason}"));

        if frame.len() < HEADER_LEN + 4 {
            return Err(corrupt("truncated"));
        }
        if &frame[0..4] != FRAME_MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
        if version != FRAME_VERSION {
            return Err(corrupt("unsupported version"));
        }
        let len = u32::from_le_bytes([frame[8], frame[9], frame[10], frame[11]]) as usize;
        if frame.len() != HEADER_LEN + len + 4 {
            return Err(corrupt("length mismatch"));
        }

        let body_end = HEADER_LEN + len;
        let stored_crc = u32::from_le_bytes([
            frame[body_end],
            frame[body_end + 1],
            frame[body_end + 2],
            frame[body_end + 3],
        ]);
        if crc32fast::hash(&frame[..body_end]) != stored_crc {
            return Err(corrupt("CRC mismatch"));
        }

        Ok(frame[HEADER_LEN..body_end].to_vec())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> HavenResult<Option<Vec<u8>>> {
        let path = self.path_for(key);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HavenError::PersistenceUnavailable(format!("open {key}: {e}"))),
        };

        let mut frame = Vec::new();
        file.read_to_end(&mut frame)
            .map_err(|e| HavenError::PersistenceUnavailable(format!("read {key}: {e}")))?;

        Self::decode_frame(key, &frame).map(Some)
    }

    fn put(&self, key: &str, value: &[u8]) -> HavenResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        let frame = Self::encode_frame(value)?;

        let io = |e: std::io::Error| HavenError::PersistenceUnavailable(format!("write {key}: {e}"));

        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)
                .map_err(io)?;
            file.write_all(&frame).map_err(io)?;
            file.sync_all().map_err(io)?;
        }
        fs::rename(&tmp, &path).map_err(io)?;

        // Persist the rename itself. Not supported on every platform.
        if let Ok(dir) = File::open(&self.root) {
            let _ = dir.sync_all();
        }

        Ok(())
    }
}

// ============================================================================
// Fault injection
// ============================================================================

/// Wraps another store and fails writes on demand.
///
/// Used to exercise the no-partial-effects guarantee when the durable store
/// goes away mid-operation.
pub struct FlakyStore<S> {
    inner: S,
    fail_writes: AtomicBool,
    /// Remaining successful writes before failures start (`usize::MAX` = never).
    writes_until_failure: AtomicUsize,
}

impl<S: KeyValueStore> FlakyStore<S> {
    /// Wraps `inner` with failures disabled.
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_writes: AtomicBool::new(false),
            writes_until_failure: AtomicUsize::new(usize::MAX),
        }
    }

    /// Makes every subsequent write fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
        self.writes_until_failure.store(usize::MAX, Ordering::SeqCst);
    }

    /// Lets `count` more writes through, then fails every write after.
    pub fn fail_after(&self, count: usize) {
        self.fail_writes.store(false, Ordering::SeqCst);
        self.writes_until_failure.store(count, Ordering::SeqCst);
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

impl<S: KeyValueStore> KeyValueStore for FlakyStore<S> {
    fn get(&self, key: &str) -> HavenResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn put(&self, key: &str, value: &[u8]) -> HavenResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(HavenError::PersistenceUnavailable(format!("injected failure writing {key}")));
        }
        let remaining = self.writes_until_failure.load(Ordering::SeqCst);
        if remaining != usize::MAX {
            if remaining == 0 {
                self.fail_writes.store(true, Ordering::SeqCst);
                return Err(HavenError::PersistenceUnavailable(format!("injected failure writing {key}")));
            }
            self.writes_until_failure.store(remaining - 1, Ordering::SeqCst);
        }
        self.inner.put(key, value)
    }
}
