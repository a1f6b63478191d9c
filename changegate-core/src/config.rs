// src/config.rs
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::services::changegate::StoragePolicy;
use crate::services::fingerprint::FingerprintAlgorithm;
use crate::services::normalize::NormalizeConfig;
use crate::services::relevance::DEFAULT_KEYWORDS;
use crate::utils::path::{absolutize, sanitize_source};

pub const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GateConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub relevance: RelevanceConfig,
    #[serde(default)]
    pub logbook: LogbookConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl GateConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            Self::parse(&text).with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using GateConfig::default().",
                path.display()
            );
            GateConfig::default()
        };
        cfg.resolve_paths(root);
        Ok(cfg)
    }

    /// Parse and validate config text. Paths stay as written.
    pub fn parse(text: &str) -> Result<Self> {
        let cfg = toml::from_str::<GateConfig>(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn source(&self, name: &str) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| s.name == name)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = Vec::new();
        for s in &self.sources {
            sanitize_source(&s.name).with_context(|| format!("[[sources]] name {:?}", s.name))?;
            if seen.contains(&s.name) {
                bail!("duplicate [[sources]] name {:?}", s.name);
            }
            seen.push(s.name.clone());
            if s.fetch.is_empty() {
                bail!("source {:?} has an empty fetch command", s.name);
            }
            if s.classify.is_empty() {
                bail!("source {:?} has an empty classify command", s.name);
            }
        }
        if self.schedule.interval_seconds == 0 {
            bail!("schedule.interval_seconds must be positive");
        }
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        self.state.dir = absolutize(root, &self.state.dir);
        self.logbook.path = absolutize(root, &self.logbook.path);
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    #[serde(default = "StateConfig::default_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub algorithm: FingerprintAlgorithm,
    #[serde(default)]
    pub on_storage_error: StoragePolicy,
}

impl StateConfig {
    fn default_dir() -> PathBuf {
        PathBuf::from("state")
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: Self::default_dir(),
            algorithm: FingerprintAlgorithm::default(),
            on_storage_error: StoragePolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RelevanceConfig {
    #[serde(default = "RelevanceConfig::default_keywords")]
    pub keywords: Vec<String>,
}

impl RelevanceConfig {
    fn default_keywords() -> Vec<String> {
        DEFAULT_KEYWORDS.iter().map(|k| k.to_string()).collect()
    }
}

impl Default for RelevanceConfig {
    fn default() -> Self {
        Self {
            keywords: Self::default_keywords(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogbookConfig {
    #[serde(default = "LogbookConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "LogbookConfig::default_path")]
    pub path: PathBuf,
}

impl LogbookConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_path() -> PathBuf {
        PathBuf::from("logbook/events.jsonl")
    }

    /// Path to append to, or `None` when disabled.
    pub fn active_path(&self) -> Option<PathBuf> {
        self.enabled.then(|| self.path.clone())
    }
}

impl Default for LogbookConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            path: Self::default_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "ScheduleConfig::default_interval_seconds")]
    pub interval_seconds: u64,
}

impl ScheduleConfig {
    fn default_interval_seconds() -> u64 {
        86_400
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_seconds: Self::default_interval_seconds(),
        }
    }
}

/// One monitored source and the external commands that serve it.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    /// argv; stdout is the observed text.
    pub fetch: Vec<String>,
    /// argv; receives the text on stdin, prints its result on stdout.
    pub classify: Vec<String>,
    /// argv; receives each watch event as JSON on stdin.
    #[serde(default)]
    pub notify: Option<Vec<String>>,
    /// Overrides `[relevance] keywords` for this source.
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
}
