// src/lib.rs
//! changegate-core: a content-fingerprint gate in front of expensive,
//! rate-limited classification calls.
//!
//! A monitored source (a broker's trading-updates page, say) is fetched on a
//! schedule. The gate normalizes the fetched text, fingerprints it and compares
//! against the last fingerprint that made it all the way through
//! classification. Only a changed page is worth another classifier call.
//!
//! Layout:
//! - `services`: the gate and everything it is built from, plus the
//!   fetch → gate → classify → notify pipeline.
//! - `commands`: root bootstrap and the `Commands` facade used by the CLI.
//! - `utils`: low-level file helpers (atomic writes, slot locks, logbook).

pub mod commands;
pub mod config;
pub mod errors;
pub mod services;
pub mod utils;

pub use errors::{GateError, StoreError};
pub use services::changegate::{
    ChangeGate, Decision, Evaluation, GateOutcome, GateSession, RunReason, StoragePolicy,
};
pub use services::fingerprint::{Fingerprint, FingerprintAlgorithm};
pub use services::normalize::{NormalizeConfig, Normalizer};
pub use services::state::{FileStateStore, MemoryStateStore, StateRecord, StateStore, StoreLock};
