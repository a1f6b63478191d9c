// src/errors.rs
use std::path::PathBuf;

use thiserror::Error;

/// Failures of a [`StateStore`](crate::services::state::StateStore) backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state {op} failed for {path:?}: {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state record {path:?} is unreadable: {detail}")]
    Corrupt { path: PathBuf, detail: String },

    #[error("state slot is locked by another run ({holder})")]
    Locked { holder: String },

    #[error("invalid source name {0:?}")]
    InvalidSource(String),

    #[error("state storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }
}

/// Errors surfaced by the change gate to its caller.
#[derive(Debug, Error)]
pub enum GateError {
    /// Caller error: the fetcher handed over nothing worth fingerprinting.
    #[error("observed text is empty after normalization")]
    EmptyInput,

    /// The persisted slot could not be read or written.
    #[error("state storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    /// Another invocation holds the slot; nothing was read or written.
    #[error("another run holds the state lock ({holder})")]
    LockContention { holder: String },

    /// The gated work failed, so the new fingerprint was not committed.
    #[error("downstream step failed: {0}")]
    Downstream(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl GateError {
    /// Short machine-friendly label used in logbook lines and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            GateError::EmptyInput => "empty_input",
            GateError::StorageUnavailable(_) => "storage_unavailable",
            GateError::LockContention { .. } => "lock_contention",
            GateError::Downstream(_) => "downstream_failed",
        }
    }
}

impl From<StoreError> for GateError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Locked { holder } => GateError::LockContention { holder },
            other => GateError::StorageUnavailable(other),
        }
    }
}
