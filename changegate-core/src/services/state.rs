// src/services/state.rs
//! Persisted "last seen" slot, one per monitored source.
//!
//! - [`StateStore`] is the injectable seam the gate talks to.
//! - [`FileStateStore`] keeps `<dir>/<source>.json` (atomic replace) and
//!   `<dir>/<source>.lock` (advisory lock).
//! - [`MemoryStateStore`] is an in-process double that can simulate read/write
//!   failures and a lock held by someone else.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;
use crate::services::fingerprint::Fingerprint;
use crate::utils::atomic::write_atomic;
use crate::utils::lock::{FileLock, LockMetadata};
use crate::utils::path::{assert_within_root_abs, sanitize_source};

pub const STATE_SCHEMA_VERSION: u32 = 1;

const SLOT_EXT: &str = "json";
const LOCK_EXT: &str = "lock";

/// What the slot remembers between runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateRecord {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub fingerprint: Fingerprint,
    /// Advisory: when this fingerprint was committed.
    pub last_changed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized_bytes: Option<u64>,
}

fn default_schema_version() -> u32 {
    STATE_SCHEMA_VERSION
}

/// RAII guard for a slot lock. Whatever it holds is released on drop.
pub struct StoreLock {
    held: Option<Box<dyn Send>>,
}

impl StoreLock {
    pub fn new<T: Send + 'static>(held: T) -> Self {
        Self {
            held: Some(Box::new(held)),
        }
    }

    /// A guard that holds nothing (stores without locking, fail-open runs).
    pub fn unguarded() -> Self {
        Self { held: None }
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl std::fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreLock").field("held", &self.is_held()).finish()
    }
}

/// Storage for a single source's [`StateRecord`].
pub trait StateStore {
    /// `Ok(None)` is the normal first-run state.
    fn read(&self) -> Result<Option<StateRecord>, StoreError>;

    /// Replace the record. Must never leave a partially written record behind.
    fn write(&self, record: &StateRecord) -> Result<(), StoreError>;

    /// Non-blocking exclusive lock over the read-decide-write sequence.
    fn try_lock(&self) -> Result<StoreLock, StoreError>;

    /// Forget the record. Returns whether one existed.
    fn clear(&self) -> Result<bool, StoreError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;

    /// Source name this slot belongs to.
    fn source(&self) -> &str;
}

// ---------- file-backed ----------

#[derive(Debug, Clone)]
pub struct FileStateStore {
    dir: PathBuf,
    source: String,
}

impl FileStateStore {
    /// Open (creating `dir` if needed) the slot for `source`.
    pub fn open(dir: impl Into<PathBuf>, source: &str) -> Result<Self, StoreError> {
        let dir = dir.into();
        let source = sanitize_source(source)?;
        fs::create_dir_all(&dir).map_err(|e| StoreError::io("create state dir", &dir, e))?;
        let store = Self { dir, source };
        assert_within_root_abs(&store.dir, &store.slot_path())?;
        Ok(store)
    }

    pub fn slot_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{SLOT_EXT}", self.source))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{LOCK_EXT}", self.source))
    }

    /// Source names that currently have a slot file under `dir`, sorted.
    pub fn list(dir: &Path) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("list", dir, e)),
        };
        let mut out = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io("list", dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some(SLOT_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if sanitize_source(stem).is_ok() {
                    out.push(stem.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> Result<Option<StateRecord>, StoreError> {
        let path = self.slot_path();
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io("read", path, e)),
        };
        serde_json::from_slice::<StateRecord>(&bytes)
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                path,
                detail: e.to_string(),
            })
    }

    fn write(&self, record: &StateRecord) -> Result<(), StoreError> {
        let path = self.slot_path();
        let bytes = serde_json::to_vec_pretty(record)
            .map_err(|e| StoreError::Unavailable(format!("encode state record: {e}")))?;
        write_atomic(&path, &bytes).map_err(|e| StoreError::io("write", path, e))
    }

    fn try_lock(&self) -> Result<StoreLock, StoreError> {
        let lock = FileLock::acquire(&self.lock_path(), LockMetadata::current(Some(&self.source)))?;
        Ok(StoreLock::new(lock))
    }

    fn clear(&self) -> Result<bool, StoreError> {
        let path = self.slot_path();
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StoreError::io("clear", path, e)),
        }
    }

    fn describe(&self) -> String {
        self.slot_path().display().to_string()
    }

    fn source(&self) -> &str {
        &self.source
    }
}

// ---------- in-memory ----------

/// Shared in-memory slot. Clones see the same record and the same lock.
#[derive(Debug, Clone)]
pub struct MemoryStateStore {
    source: String,
    record: Arc<Mutex<Option<StateRecord>>>,
    locked: Arc<AtomicBool>,
    fail_reads: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    writes: Arc<Mutex<u64>>,
}

impl MemoryStateStore {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            record: Arc::new(Mutex::new(None)),
            locked: Arc::new(AtomicBool::new(false)),
            fail_reads: Arc::new(AtomicBool::new(false)),
            fail_writes: Arc::new(AtomicBool::new(false)),
            writes: Arc::new(Mutex::new(0)),
        }
    }

    pub fn with_record(source: &str, record: StateRecord) -> Self {
        let store = Self::new(source);
        if let Ok(mut slot) = store.record.lock() {
            *slot = Some(record);
        }
        store
    }

    /// Current record without going through the trait (no failure simulation).
    pub fn snapshot(&self) -> Option<StateRecord> {
        self.record.lock().ok().and_then(|r| r.clone())
    }

    /// Number of successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.writes.lock().map(|n| *n).unwrap_or(0)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Pretend another run holds the lock until the returned guard drops.
    pub fn hold_lock(&self) -> Result<StoreLock, StoreError> {
        self.try_lock()
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("in-memory slot poisoned".to_string())
    }
}

struct MemoryLock(Arc<AtomicBool>);

impl Drop for MemoryLock {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> Result<Option<StateRecord>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated read failure".to_string()));
        }
        let slot = self.record.lock().map_err(|_| Self::poisoned())?;
        Ok(slot.clone())
    }

    fn write(&self, record: &StateRecord) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("simulated write failure".to_string()));
        }
        let mut slot = self.record.lock().map_err(|_| Self::poisoned())?;
        *slot = Some(record.clone());
        let mut n = self.writes.lock().map_err(|_| Self::poisoned())?;
        *n += 1;
        Ok(())
    }

    fn try_lock(&self) -> Result<StoreLock, StoreError> {
        if self
            .locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(StoreError::Locked {
                holder: format!("in-memory slot {}", self.source),
            });
        }
        Ok(StoreLock::new(MemoryLock(self.locked.clone())))
    }

    fn clear(&self) -> Result<bool, StoreError> {
        let mut slot = self.record.lock().map_err(|_| Self::poisoned())?;
        Ok(slot.take().is_some())
    }

    fn describe(&self) -> String {
        format!("memory:{}", self.source)
    }

    fn source(&self) -> &str {
        &self.source
    }
}
