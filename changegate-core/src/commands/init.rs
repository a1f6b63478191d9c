// src/commands/init.rs

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CONFIG_FILE;
use crate::utils::atomic::write_atomic;

#[derive(Debug, Clone)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

/// Resolve the workspace root. `CHANGEGATE_ROOT` overrides the default.
pub fn default_root() -> PathBuf {
    std::env::var_os("CHANGEGATE_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".changegate"))
}

/// Create the root layout (idempotent). Existing files are never overwritten.
pub fn ensure_initialized(root: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(root, "", &mut created, &mut existed)?;
    ensure_dir(root, "state", &mut created, &mut existed)?;
    ensure_dir(root, "logbook", &mut created, &mut existed)?;
    ensure_file(root, CONFIG_FILE, DEFAULT_CONFIG_TOML, &mut created, &mut existed)?;

    Ok(InitReport {
        root: root.to_path_buf(),
        created,
        existed,
    })
}

fn ensure_dir(
    base: &Path,
    rel: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &str,
    content_if_absent: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    if p.exists() {
        existed.push(rel_file.to_string());
        return Ok(());
    }
    write_atomic(&p, content_if_absent.as_bytes()).with_context(|| format!("write {:?}", p))?;
    created.push(rel_file.to_string());
    Ok(())
}

// ---------- defaults ----------

pub const DEFAULT_CONFIG_TOML: &str = r#"# changegate configuration. Relative paths resolve against this directory.

[state]
dir = "state"
algorithm = "blake3"          # or "sha256"
on_storage_error = "fail_open" # or "fail_closed"

[normalize]
strip_invisible = true
collapse_whitespace = true
drop_blank_lines = true
lowercase = false
ignore_lines = []
mask_patterns = []

[relevance]
keywords = ["maintenance", "crypto market is closed", "ctrader"]

[logbook]
enabled = true
path = "logbook/events.jsonl"

[schedule]
interval_seconds = 86400

# [[sources]]
# name = "trading-updates"
# fetch = ["sh", "-c", "./fetch_updates.sh"]
# classify = ["sh", "-c", "./classify.sh"]
# notify = ["sh", "-c", "./notify.sh"]
"#;
