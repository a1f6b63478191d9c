// src/services/changegate.rs
//! The change gate: should this observed text go to the classifier again?
//!
//! Contract:
//! - SKIP iff the fingerprint of the normalized text is bit-identical to the
//!   committed one.
//! - State is written only by [`GateSession::commit`], which the caller invokes
//!   after the downstream step succeeded. A run that dies between RUN and commit
//!   leaves the slot untouched, so the next run is RUN again.
//! - The slot lock is held from [`ChangeGate::begin`] until the session drops.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::errors::{GateError, StoreError};
use crate::services::fingerprint::{Fingerprint, FingerprintAlgorithm};
use crate::services::normalize::Normalizer;
use crate::services::state::{STATE_SCHEMA_VERSION, StateRecord, StateStore, StoreLock};

/// What to do when the slot cannot be read (or its lock file cannot be opened).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoragePolicy {
    /// Decide RUN and carry a warning. An extra classifier call is cheaper than
    /// a missed announcement.
    #[default]
    FailOpen,
    /// Return [`GateError::StorageUnavailable`] and let the caller decide.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunReason {
    FirstSeen,
    Changed,
    AlgorithmChanged,
    StorageUnavailable,
}

impl RunReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunReason::FirstSeen => "first_seen",
            RunReason::Changed => "changed",
            RunReason::AlgorithmChanged => "algorithm_changed",
            RunReason::StorageUnavailable => "storage_unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Run(RunReason),
    Skip,
}

impl Decision {
    pub fn is_run(&self) -> bool {
        matches!(self, Decision::Run(_))
    }

    pub fn reason(&self) -> Option<RunReason> {
        match self {
            Decision::Run(r) => Some(*r),
            Decision::Skip => None,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Run(r) => write!(f, "run ({})", r.as_str()),
            Decision::Skip => f.write_str("skip"),
        }
    }
}

/// Result of one evaluation. Hand it back to [`GateSession::commit`].
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub source: String,
    pub decision: Decision,
    pub fingerprint: Fingerprint,
    pub normalized_bytes: u64,
    pub previous: Option<StateRecord>,
    /// Set when a storage problem was tolerated under [`StoragePolicy::FailOpen`].
    pub warning: Option<String>,
}

impl Evaluation {
    pub fn should_run(&self) -> bool {
        self.decision.is_run()
    }

    pub fn to_json(&self) -> Value {
        json!({
            "source": self.source,
            "decision": if self.should_run() { "run" } else { "skip" },
            "reason": self.decision.reason().map(|r| r.as_str()),
            "fingerprint": self.fingerprint.to_string(),
            "normalized_bytes": self.normalized_bytes,
            "previous_fingerprint": self.previous.as_ref().map(|p| p.fingerprint.to_string()),
            "previous_changed_at": self.previous.as_ref().map(|p| p.last_changed_at.to_rfc3339()),
            "warning": self.warning,
        })
    }
}

/// What [`ChangeGate::run_gated`] did.
#[derive(Debug)]
pub enum GateOutcome<T> {
    Skipped(Evaluation),
    Completed {
        evaluation: Evaluation,
        record: StateRecord,
        output: T,
    },
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct ChangeGate<S> {
    store: S,
    normalizer: Normalizer,
    algorithm: FingerprintAlgorithm,
    policy: StoragePolicy,
    clock: Clock,
}

impl<S: StateStore> ChangeGate<S> {
    pub fn new(store: S, normalizer: Normalizer) -> Self {
        Self {
            store,
            normalizer,
            algorithm: FingerprintAlgorithm::default(),
            policy: StoragePolicy::default(),
            clock: Arc::new(Utc::now),
        }
    }

    pub fn with_algorithm(mut self, algorithm: FingerprintAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_policy(mut self, policy: StoragePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Override the timestamp source used for `last_changed_at`.
    pub fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn policy(&self) -> StoragePolicy {
        self.policy
    }

    pub fn algorithm(&self) -> FingerprintAlgorithm {
        self.algorithm
    }

    /// Normalize and hash without touching storage.
    pub fn fingerprint(&self, text: &str) -> Result<(Fingerprint, u64), GateError> {
        if text.trim().is_empty() {
            return Err(GateError::EmptyInput);
        }
        let normalized = self.normalizer.normalize(text);
        if normalized.is_empty() {
            return Err(GateError::EmptyInput);
        }
        let fp = Fingerprint::compute(self.algorithm, normalized.as_bytes());
        Ok((fp, normalized.len() as u64))
    }

    /// Take the slot lock and open a read-decide-write session.
    ///
    /// Contention fails immediately with [`GateError::LockContention`]. A lock
    /// file that cannot even be opened follows the storage policy.
    pub fn begin(&self) -> Result<GateSession<'_, S>, GateError> {
        match self.store.try_lock() {
            Ok(lock) => Ok(GateSession {
                gate: self,
                lock,
                lock_warning: None,
            }),
            Err(StoreError::Locked { holder }) => {
                tracing::warn!(source = %self.store.source(), %holder, "state slot busy; aborting this run");
                Err(GateError::LockContention { holder })
            }
            Err(err) => match self.policy {
                StoragePolicy::FailOpen => {
                    tracing::warn!(
                        source = %self.store.source(),
                        error = %err,
                        "could not lock state slot; continuing unlocked (fail open)"
                    );
                    Ok(GateSession {
                        gate: self,
                        lock: StoreLock::unguarded(),
                        lock_warning: Some(format!("state lock unavailable: {err}")),
                    })
                }
                StoragePolicy::FailClosed => Err(GateError::StorageUnavailable(err)),
            },
        }
    }

    /// Dry evaluation: lock, decide, release. Never writes.
    pub fn evaluate(&self, text: &str) -> Result<Evaluation, GateError> {
        self.begin()?.evaluate(text)
    }

    /// Lock, evaluate, run `work` on RUN, and commit only if `work` succeeded.
    pub fn run_gated<T, F>(&self, text: &str, work: F) -> Result<GateOutcome<T>, GateError>
    where
        F: FnOnce(&Evaluation) -> anyhow::Result<T>,
    {
        let session = self.begin()?;
        let evaluation = session.evaluate(text)?;
        if !evaluation.should_run() {
            return Ok(GateOutcome::Skipped(evaluation));
        }
        let output = work(&evaluation).map_err(|e| {
            tracing::warn!(source = %evaluation.source, error = %e, "gated work failed; state not advanced");
            GateError::Downstream(e.into())
        })?;
        let record = session
            .commit(&evaluation)?
            .ok_or_else(|| GateError::StorageUnavailable(StoreError::Unavailable("nothing committed".into())))?;
        Ok(GateOutcome::Completed {
            evaluation,
            record,
            output,
        })
    }
}

/// A locked read-decide-write sequence over one slot. Dropping it without
/// [`commit`](GateSession::commit) releases the lock and writes nothing.
pub struct GateSession<'g, S> {
    gate: &'g ChangeGate<S>,
    lock: StoreLock,
    lock_warning: Option<String>,
}

impl<S: StateStore> GateSession<'_, S> {
    pub fn is_locked(&self) -> bool {
        self.lock.is_held()
    }

    pub fn evaluate(&self, text: &str) -> Result<Evaluation, GateError> {
        let gate = self.gate;
        let (fingerprint, normalized_bytes) = gate.fingerprint(text)?;
        let source = gate.store.source().to_string();

        let (decision, previous, read_warning) = match gate.store.read() {
            Ok(None) => (Decision::Run(RunReason::FirstSeen), None, None),
            Ok(Some(prev)) => {
                let decision = if prev.fingerprint == fingerprint {
                    Decision::Skip
                } else if prev.fingerprint.algorithm() != fingerprint.algorithm() {
                    Decision::Run(RunReason::AlgorithmChanged)
                } else {
                    Decision::Run(RunReason::Changed)
                };
                (decision, Some(prev), None)
            }
            Err(err) => match gate.policy {
                StoragePolicy::FailOpen => {
                    tracing::warn!(
                        source = %source,
                        store = %gate.store.describe(),
                        error = %err,
                        "state unreadable; deciding RUN (fail open)"
                    );
                    (
                        Decision::Run(RunReason::StorageUnavailable),
                        None,
                        Some(format!("state unreadable: {err}")),
                    )
                }
                StoragePolicy::FailClosed => return Err(GateError::StorageUnavailable(err)),
            },
        };

        let warning = match (self.lock_warning.clone(), read_warning) {
            (Some(a), Some(b)) => Some(format!("{a}; {b}")),
            (a, b) => a.or(b),
        };

        tracing::info!(
            source = %source,
            decision = %decision,
            fingerprint = %fingerprint.short(),
            "change gate evaluated"
        );

        Ok(Evaluation {
            source,
            decision,
            fingerprint,
            normalized_bytes,
            previous,
            warning,
        })
    }

    /// Persist the evaluated fingerprint. Call only after the downstream step
    /// succeeded. A SKIP evaluation commits nothing and returns `None`.
    pub fn commit(self, evaluation: &Evaluation) -> Result<Option<StateRecord>, GateError> {
        if !evaluation.should_run() {
            return Ok(None);
        }
        let store = &self.gate.store;
        if evaluation.source != store.source() {
            return Err(GateError::StorageUnavailable(StoreError::Unavailable(format!(
                "evaluation for {:?} cannot be committed to slot {:?}",
                evaluation.source,
                store.source()
            ))));
        }

        let record = StateRecord {
            schema_version: STATE_SCHEMA_VERSION,
            fingerprint: evaluation.fingerprint,
            last_changed_at: (self.gate.clock)(),
            source: Some(evaluation.source.clone()),
            normalized_bytes: Some(evaluation.normalized_bytes),
        };
        store.write(&record).map_err(|err| {
            tracing::warn!(source = %evaluation.source, error = %err, "state commit failed");
            GateError::StorageUnavailable(err)
        })?;

        tracing::info!(
            source = %evaluation.source,
            fingerprint = %record.fingerprint.short(),
            "state committed"
        );
        Ok(Some(record))
    }
}
