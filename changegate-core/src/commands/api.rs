// src/commands/api.rs
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Value, json};
use std::path::{Path, PathBuf};

use crate::config::GateConfig;
use crate::errors::GateError;
use crate::services::changegate::{ChangeGate, Evaluation};
use crate::services::fingerprint::Fingerprint;
use crate::services::normalize::Normalizer;
use crate::services::relevance::RelevanceFilter;
use crate::services::state::{FileStateStore, StateRecord, StateStore};
use crate::utils::logbook::emit_event;

/// Facade over one changegate root: config + file-backed slots + logbook.
pub struct Commands {
    root: PathBuf,
    config: GateConfig,
    normalizer: Normalizer,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotStatus {
    pub source: String,
    pub configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<StateRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Commands {
    /// Load `<root>/config.toml` (defaults when absent). Does not create anything.
    pub fn open(root: &Path) -> Result<Self> {
        let config = GateConfig::load(root)?;
        Self::from_config(root, config)
    }

    pub fn from_config(root: &Path, config: GateConfig) -> Result<Self> {
        let normalizer = Normalizer::from_config(&config.normalize).context("building normalizer")?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
            normalizer,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    /// A gate over the file slot for `source`, configured from `[state]`.
    pub fn gate(&self, source: &str) -> Result<ChangeGate<FileStateStore>> {
        let store = FileStateStore::open(&self.config.state.dir, source)
            .with_context(|| format!("opening state slot for {source:?}"))?;
        Ok(ChangeGate::new(store, self.normalizer.clone())
            .with_algorithm(self.config.state.algorithm)
            .with_policy(self.config.state.on_storage_error))
    }

    /// Normalized text and its fingerprint. No slot involved.
    pub fn fingerprint(&self, text: &str) -> Result<(Fingerprint, String)> {
        let normalized = self.normalizer.normalize(text);
        if normalized.is_empty() {
            return Err(GateError::EmptyInput.into());
        }
        let fp = Fingerprint::compute(self.config.state.algorithm, normalized.as_bytes());
        Ok((fp, normalized))
    }

    /// Dry evaluation against the stored slot. Never commits.
    pub fn check(&self, source: &str, text: &str) -> Result<Evaluation> {
        let gate = self.gate(source)?;
        let evaluation = gate.evaluate(text)?;
        self.record("gate_checked", evaluation.to_json());
        Ok(evaluation)
    }

    pub fn status(&self, source: &str) -> Result<Option<StateRecord>> {
        let store = FileStateStore::open(&self.config.state.dir, source)?;
        Ok(store.read()?)
    }

    /// Configured sources plus any slot found on disk, sorted by name.
    pub fn statuses(&self) -> Result<Vec<SlotStatus>> {
        let mut names: Vec<String> = self.config.sources.iter().map(|s| s.name.clone()).collect();
        for name in FileStateStore::list(&self.config.state.dir)? {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();

        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let configured = self.config.source(&name).is_some();
            let (record, error) = match self.status(&name) {
                Ok(r) => (r, None),
                Err(e) => (None, Some(format!("{e:#}"))),
            };
            out.push(SlotStatus {
                source: name,
                configured,
                record,
                error,
            });
        }
        Ok(out)
    }

    /// Forget a slot so the next run is treated as first-seen. Refuses while a
    /// run holds the slot.
    pub fn reset(&self, source: &str) -> Result<bool> {
        let store = FileStateStore::open(&self.config.state.dir, source)?;
        let _lock = store.try_lock().map_err(GateError::from)?;
        let removed = store.clear()?;
        self.record("slot_reset", json!({ "source": source, "removed": removed }));
        Ok(removed)
    }

    /// Per-source keywords if configured, else the global list.
    pub fn relevance_for(&self, source: &str) -> RelevanceFilter {
        match self.config.source(source).and_then(|s| s.keywords.as_ref()) {
            Some(keywords) => RelevanceFilter::new(keywords),
            None => RelevanceFilter::new(&self.config.relevance.keywords),
        }
    }

    pub fn logbook_path(&self) -> Option<PathBuf> {
        self.config.logbook.active_path()
    }

    /// Best-effort logbook append.
    pub fn record(&self, event: &str, data: Value) {
        let Some(path) = self.logbook_path() else { return };
        if let Err(e) = emit_event(&path, event, data) {
            tracing::warn!(path = %path.display(), error = %e, "logbook append failed");
        }
    }
}
