// src/services/normalize.rs
//! Text normalization applied before fingerprinting.
//!
//! Policy (defaults):
//! - `\r\n` and lone `\r` become `\n`.
//! - Drop control characters (except `\n`/`\t`) and zero-width characters
//!   (ZWS/ZWNJ/ZWJ/WJ/BOM).
//! - Trim every line and collapse internal whitespace runs to one space.
//! - Remove lines matching `ignore_lines`, mask substrings matching `mask_patterns`.
//! - Drop blank lines; join with `\n`; no trailing newline.
//! - Lowercasing is opt-in.
//!
//! Every run must use the same settings. Changing them changes fingerprints,
//! which costs one extra classification per source and nothing worse.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Placeholder left where a `mask_patterns` match was removed.
pub const MASK_TOKEN: &str = "∅";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    #[serde(default = "NormalizeConfig::default_true")]
    pub strip_invisible: bool,
    #[serde(default = "NormalizeConfig::default_true")]
    pub collapse_whitespace: bool,
    #[serde(default = "NormalizeConfig::default_true")]
    pub drop_blank_lines: bool,
    #[serde(default)]
    pub lowercase: bool,
    /// Regexes; a line matching any of them is removed entirely.
    #[serde(default)]
    pub ignore_lines: Vec<String>,
    /// Regexes; matching substrings are replaced by [`MASK_TOKEN`].
    #[serde(default)]
    pub mask_patterns: Vec<String>,
}

impl NormalizeConfig {
    fn default_true() -> bool {
        true
    }
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            strip_invisible: true,
            collapse_whitespace: true,
            drop_blank_lines: true,
            lowercase: false,
            ignore_lines: Vec::new(),
            mask_patterns: Vec::new(),
        }
    }
}

/// Compiled normalization rule.
#[derive(Debug, Clone)]
pub struct Normalizer {
    config: NormalizeConfig,
    ignore_lines: Vec<Regex>,
    mask_patterns: Vec<Regex>,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            config: NormalizeConfig::default(),
            ignore_lines: Vec::new(),
            mask_patterns: Vec::new(),
        }
    }
}

impl Normalizer {
    pub fn from_config(config: &NormalizeConfig) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            ignore_lines: compile_all(&config.ignore_lines, "normalize.ignore_lines")?,
            mask_patterns: compile_all(&config.mask_patterns, "normalize.mask_patterns")?,
        })
    }

    pub fn config(&self) -> &NormalizeConfig {
        &self.config
    }

    pub fn normalize(&self, raw: &str) -> String {
        let unified = raw.replace("\r\n", "\n").replace('\r', "\n");
        let cleaned = if self.config.strip_invisible {
            strip_invisible(&unified)
        } else {
            unified
        };

        let mut lines: Vec<String> = Vec::new();
        for line in cleaned.split('\n') {
            if self.ignore_lines.iter().any(|re| re.is_match(line)) {
                continue;
            }
            let mut line = line.to_string();
            for re in &self.mask_patterns {
                line = re.replace_all(&line, MASK_TOKEN).into_owned();
            }
            if self.config.collapse_whitespace {
                line = line.split_whitespace().collect::<Vec<_>>().join(" ");
            }
            if self.config.drop_blank_lines && line.trim().is_empty() {
                continue;
            }
            if self.config.lowercase {
                line = line.to_lowercase();
            }
            lines.push(line);
        }

        // Without blank-line dropping, still ignore leading/trailing blank lines
        // so a trailing newline is never material.
        while lines.last().is_some_and(|l| l.trim().is_empty()) {
            lines.pop();
        }
        let first = lines.iter().position(|l| !l.trim().is_empty()).unwrap_or(lines.len());
        lines.drain(..first);

        lines.join("\n")
    }
}

fn compile_all(patterns: &[String], field: &str) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).with_context(|| format!("invalid regex in {field}: {p:?}")))
        .collect()
}

fn strip_invisible(s: &str) -> String {
    s.chars()
        .filter(|&ch| {
            if ch == '\n' || ch == '\t' {
                return true;
            }
            !ch.is_control()
                && !matches!(ch, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
        })
        .collect()
}

/// Form used for keyword matching: invisible characters removed, every
/// whitespace run (line breaks included) collapsed to one space, lowercased.
pub fn for_keywords(s: &str) -> String {
    strip_invisible(s)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
