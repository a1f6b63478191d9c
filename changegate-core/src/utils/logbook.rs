// src/utils/logbook.rs
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::{fs, io::Write, path::Path};

#[derive(Serialize)]
struct EventLine<'a> {
    ts: String,
    event: &'a str,
    data: Value,
}

/// Append one `{ts, event, data}` line to a JSONL logbook, creating it if needed.
pub fn emit_event(log_path: &Path, event: &str, data: Value) -> Result<()> {
    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create logbook dir {:?}", parent))?;
    }
    let line = EventLine {
        ts: Utc::now().to_rfc3339(),
        event,
        data,
    };
    let json = serde_json::to_string(&line)?;
    let mut f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)
        .with_context(|| format!("open logbook {:?}", log_path))?;
    writeln!(f, "{}", json)?;
    Ok(())
}

/// Short single-line preview for log payloads.
pub fn preview(content: &str, max_chars: usize) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let mut out = flat.chars().take(max_chars).collect::<String>();
    out.push('…');
    out
}
