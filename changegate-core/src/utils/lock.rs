// src/utils/lock.rs
//! Single-owner lock for one state slot.
//!
//! Path: `<state_dir>/<source>.lock`. The file carries JSON [`LockMetadata`]
//! so a contending run can say who holds the slot. Exclusion comes from the
//! OS advisory lock (`flock`/`LockFileEx` via `fs2`), not from the file's
//! existence: a lock file left behind by a killed process is simply reacquired.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::errors::StoreError;

/// Metadata written into the lock file by the holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockMetadata {
    pub pid: u32,
    pub user: String,
    pub started_at: DateTime<Utc>,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LockMetadata {
    /// Metadata for the current process.
    pub fn current(source: Option<&str>) -> Self {
        Self {
            pid: std::process::id(),
            user: whoami::username(),
            started_at: Utc::now(),
            run_id: uuid::Uuid::new_v4().to_string(),
            source: source.map(str::to_string),
        }
    }

    pub fn display_summary(&self) -> String {
        let age = Utc::now().signed_duration_since(self.started_at);
        let age_str = if age.num_hours() > 0 {
            format!("{}h {}m ago", age.num_hours(), age.num_minutes() % 60)
        } else if age.num_minutes() > 0 {
            format!("{}m {}s ago", age.num_minutes(), age.num_seconds() % 60)
        } else {
            format!("{}s ago", age.num_seconds())
        };
        format!("pid {} ({}) started {}, run {}", self.pid, self.user, age_str, self.run_id)
    }
}

/// A held slot lock. Released when dropped.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
    metadata: LockMetadata,
}

impl FileLock {
    /// Try once to take the lock; never blocks.
    ///
    /// - `Ok(FileLock)`: acquired, metadata written.
    /// - `Err(StoreError::Locked)`: another open handle holds it.
    /// - `Err(StoreError::Io)`: the lock file could not be opened or locked.
    pub fn acquire(path: &Path, metadata: LockMetadata) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io("create lock dir", parent, e))?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| StoreError::io("open lock", path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                let holder = read_lock_metadata(path)
                    .map(|m| m.display_summary())
                    .unwrap_or_else(|| "unknown holder".to_string());
                return Err(StoreError::Locked { holder });
            }
            return Err(StoreError::io("lock", path, e));
        }

        // Previous holder may have died without cleanup; its metadata is stale.
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| StoreError::Unavailable(format!("encode lock metadata: {e}")))?;
        file.set_len(0)
            .and_then(|_| file.seek(SeekFrom::Start(0)))
            .and_then(|_| file.write_all(&json))
            .and_then(|_| file.sync_all())
            .map_err(|e| StoreError::io("write lock metadata", path, e))?;

        tracing::debug!(path = %path.display(), run_id = %metadata.run_id, "slot lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            metadata,
        })
    }

    pub fn metadata(&self) -> &LockMetadata {
        &self.metadata
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        tracing::debug!(path = %self.path.display(), "slot lock released");
    }
}

/// Read the holder's metadata; `None` when missing or mid-write.
pub fn read_lock_metadata(path: &Path) -> Option<LockMetadata> {
    let mut contents = String::new();
    File::open(path).ok()?.read_to_string(&mut contents).ok()?;
    serde_json::from_str(&contents).ok()
}
