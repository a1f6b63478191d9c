// src/services/watch.rs
//! One scheduling tick for one monitored source:
//!
//!   fetch → gate → keyword filter → classify → notify → commit
//!
//! Fetching, classification and notification delivery are external
//! collaborators behind traits. The watcher only decides when each runs and
//! when the gate may advance its state. The fingerprint is committed only after
//! the `Classified` event was delivered; every other path leaves the slot
//! untouched so the next tick looks at the page again.

use std::path::PathBuf;

use serde::Serialize;
use serde_json::Value;

use crate::errors::GateError;
use crate::services::changegate::{ChangeGate, Evaluation, GateSession};
use crate::services::relevance::RelevanceFilter;
use crate::services::state::{StateRecord, StateStore};
use crate::utils::logbook::{emit_event, preview};

/// Produces the current text of a source.
pub trait Fetcher {
    fn fetch(&self, source: &str) -> anyhow::Result<String>;
}

/// The expensive step the gate protects.
pub trait Classifier {
    fn classify(&self, source: &str, text: &str) -> anyhow::Result<Value>;
}

/// Receives results and problems. An `Err` on a `Classified` event keeps the
/// state from advancing, so the result is delivered again on the next tick.
pub trait Notifier {
    fn notify(&self, event: &WatchEvent) -> anyhow::Result<()>;
}

/// Delivers to every notifier, even after one fails; reports the first failure.
impl Notifier for Vec<Box<dyn Notifier>> {
    fn notify(&self, event: &WatchEvent) -> anyhow::Result<()> {
        let mut first_err = None;
        for n in self {
            if let Err(e) = n.notify(event) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WatchEvent {
    FetchFailed {
        source: String,
        message: String,
    },
    Contended {
        source: String,
        holder: String,
    },
    StorageWarning {
        source: String,
        message: String,
    },
    ClassifierFailed {
        source: String,
        message: String,
    },
    Classified {
        source: String,
        fingerprint: String,
        keywords: Vec<String>,
        result: Value,
    },
}

impl WatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WatchEvent::FetchFailed { .. } => "fetch_failed",
            WatchEvent::Contended { .. } => "contended",
            WatchEvent::StorageWarning { .. } => "storage_warning",
            WatchEvent::ClassifierFailed { .. } => "classifier_failed",
            WatchEvent::Classified { .. } => "classified",
        }
    }

    pub fn source(&self) -> &str {
        match self {
            WatchEvent::FetchFailed { source, .. }
            | WatchEvent::Contended { source, .. }
            | WatchEvent::StorageWarning { source, .. }
            | WatchEvent::ClassifierFailed { source, .. }
            | WatchEvent::Classified { source, .. } => source,
        }
    }

    pub fn is_problem(&self) -> bool {
        !matches!(self, WatchEvent::Classified { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchOutcome {
    FetchFailed,
    Contended,
    Skipped,
    Irrelevant,
    ClassifierFailed,
    /// Classified, but the result could not be delivered.
    NotifyFailed(Value),
    Classified(Value),
}

impl WatchOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            WatchOutcome::FetchFailed => "fetch_failed",
            WatchOutcome::Contended => "contended",
            WatchOutcome::Skipped => "skipped",
            WatchOutcome::Irrelevant => "irrelevant",
            WatchOutcome::ClassifierFailed => "classifier_failed",
            WatchOutcome::NotifyFailed(_) => "notify_failed",
            WatchOutcome::Classified(_) => "classified",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchReport {
    pub source: String,
    pub outcome: WatchOutcome,
    pub evaluation: Option<Evaluation>,
    pub committed: Option<StateRecord>,
    pub warnings: Vec<String>,
}

impl WatchReport {
    fn new(source: &str, outcome: WatchOutcome) -> Self {
        Self {
            source: source.to_string(),
            outcome,
            evaluation: None,
            committed: None,
            warnings: Vec::new(),
        }
    }
}

pub struct Watcher<'a, S> {
    gate: &'a ChangeGate<S>,
    relevance: RelevanceFilter,
    fetcher: &'a dyn Fetcher,
    classifier: &'a dyn Classifier,
    notifier: &'a dyn Notifier,
}

impl<'a, S: StateStore> Watcher<'a, S> {
    pub fn new(
        gate: &'a ChangeGate<S>,
        fetcher: &'a dyn Fetcher,
        classifier: &'a dyn Classifier,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            gate,
            relevance: RelevanceFilter::default(),
            fetcher,
            classifier,
            notifier,
        }
    }

    pub fn with_relevance(mut self, relevance: RelevanceFilter) -> Self {
        self.relevance = relevance;
        self
    }

    /// Run one tick. `Err` only for storage failures under fail-closed policy;
    /// every other problem is reported through the outcome and the notifier.
    pub fn run_once(&self) -> Result<WatchReport, GateError> {
        let source = self.gate.store().source().to_string();

        let text = match self.fetcher.fetch(&source) {
            Ok(t) if !t.trim().is_empty() => t,
            Ok(_) => return Ok(self.fetch_failed(&source, "fetcher returned no text".to_string())),
            Err(e) => return Ok(self.fetch_failed(&source, format!("{e:#}"))),
        };
        tracing::debug!(source = %source, bytes = text.len(), preview = %preview(&text, 120), "fetched");

        let session = match self.gate.begin() {
            Ok(s) => s,
            Err(GateError::LockContention { holder }) => {
                self.announce(&WatchEvent::Contended {
                    source: source.clone(),
                    holder,
                });
                return Ok(WatchReport::new(&source, WatchOutcome::Contended));
            }
            Err(e) => return Err(self.storage_failure(&source, e)),
        };

        let evaluation = match session.evaluate(&text) {
            Ok(ev) => ev,
            Err(GateError::EmptyInput) => {
                return Ok(self.fetch_failed(&source, "nothing left after normalization".to_string()));
            }
            Err(e) => return Err(self.storage_failure(&source, e)),
        };

        let mut report = WatchReport::new(&source, WatchOutcome::Skipped);
        if let Some(w) = &evaluation.warning {
            report.warnings.push(w.clone());
            self.announce(&WatchEvent::StorageWarning {
                source: source.clone(),
                message: w.clone(),
            });
        }

        if !evaluation.should_run() {
            tracing::info!(source = %source, "unchanged since last classification; skipping");
            report.evaluation = Some(evaluation);
            return Ok(report);
        }

        let keywords = self.relevance.matches(&text);
        if !self.relevance.keywords().is_empty() && keywords.is_empty() {
            drop(session);
            tracing::info!(source = %source, "changed, but no keyword matched; not classifying");
            report.outcome = WatchOutcome::Irrelevant;
            report.evaluation = Some(evaluation);
            return Ok(report);
        }

        tracing::info!(source = %source, keywords = ?keywords, "relevant change; classifying");
        let result = match self.classifier.classify(&source, &text) {
            Ok(result) => result,
            Err(e) => {
                drop(session);
                tracing::warn!(source = %source, error = %format!("{e:#}"), "classifier failed; state not advanced");
                self.announce(&WatchEvent::ClassifierFailed {
                    source: source.clone(),
                    message: format!("{e:#}"),
                });
                report.outcome = WatchOutcome::ClassifierFailed;
                report.evaluation = Some(evaluation);
                return Ok(report);
            }
        };

        let delivered = self.notifier.notify(&WatchEvent::Classified {
            source: source.clone(),
            fingerprint: evaluation.fingerprint.to_string(),
            keywords,
            result: result.clone(),
        });
        match delivered {
            Ok(()) => {
                report.committed = self.commit(session, &evaluation, &mut report.warnings);
                report.outcome = WatchOutcome::Classified(result);
            }
            Err(e) => {
                drop(session);
                let message = format!("{e:#}");
                tracing::warn!(source = %source, error = %message, "result not delivered; state not advanced");
                report.warnings.push(format!("notify failed: {message}"));
                report.outcome = WatchOutcome::NotifyFailed(result);
            }
        }
        report.evaluation = Some(evaluation);
        Ok(report)
    }

    fn commit(
        &self,
        session: GateSession<'_, S>,
        evaluation: &Evaluation,
        warnings: &mut Vec<String>,
    ) -> Option<StateRecord> {
        match session.commit(evaluation) {
            Ok(record) => record,
            Err(e) => {
                let message = e.to_string();
                warnings.push(message.clone());
                self.announce(&WatchEvent::StorageWarning {
                    source: evaluation.source.clone(),
                    message,
                });
                None
            }
        }
    }

    fn fetch_failed(&self, source: &str, message: String) -> WatchReport {
        tracing::warn!(source = %source, %message, "fetch failed; state untouched");
        self.announce(&WatchEvent::FetchFailed {
            source: source.to_string(),
            message,
        });
        WatchReport::new(source, WatchOutcome::FetchFailed)
    }

    fn storage_failure(&self, source: &str, err: GateError) -> GateError {
        if matches!(err, GateError::StorageUnavailable(_)) {
            self.announce(&WatchEvent::StorageWarning {
                source: source.to_string(),
                message: err.to_string(),
            });
        }
        err
    }

    /// Problem reports are best effort: a failed delivery is only logged.
    fn announce(&self, event: &WatchEvent) {
        if let Err(e) = self.notifier.notify(event) {
            tracing::warn!(source = %event.source(), event = event.name(), error = %format!("{e:#}"), "notify failed");
        }
    }
}

/// Logs every event through `tracing` and, when a path is set, appends it to
/// the JSONL logbook.
#[derive(Debug, Clone, Default)]
pub struct LogbookNotifier {
    path: Option<PathBuf>,
}

impl LogbookNotifier {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }
}

impl Notifier for LogbookNotifier {
    fn notify(&self, event: &WatchEvent) -> anyhow::Result<()> {
        if event.is_problem() {
            tracing::warn!(source = %event.source(), event = event.name(), "watch event");
        } else {
            tracing::info!(source = %event.source(), event = event.name(), "watch event");
        }
        let Some(path) = &self.path else { return Ok(()) };
        let data = serde_json::to_value(event)?;
        emit_event(path, event.name(), data)
    }
}
