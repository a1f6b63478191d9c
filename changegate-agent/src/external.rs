// src/external.rs
//! External-command collaborators.
//!
//! Scraping, classification and delivery stay outside this program; each is a
//! user-supplied argv. The source name is exported as `CHANGEGATE_SOURCE`.

use std::io::{self, Write};
use std::process::{ChildStdin, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow, bail};
use serde_json::Value;

use changegate_core::services::watch::{Classifier, Fetcher, Notifier, WatchEvent};

const STDERR_TAIL: usize = 400;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Spawn `argv`, feed `stdin` (if any) from a writer thread, capture output.
pub fn run_captured(argv: &[String], source: &str, stdin: Option<Vec<u8>>) -> Result<CommandOutput> {
    let (program, args) = argv.split_first().ok_or_else(|| anyhow!("empty command"))?;
    let mut child = Command::new(program)
        .args(args)
        .env("CHANGEGATE_SOURCE", source)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program:?}"))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(bytes), Some(pipe)) => Some(spawn_stdin_writer(pipe, bytes)),
        _ => None,
    };
    let output = child
        .wait_with_output()
        .with_context(|| format!("wait for {program:?}"))?;
    if let Some(handle) = writer {
        join_stdin_writer(handle, program)?;
    }
    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Write `bytes` to a child's stdin on its own thread so a full pipe cannot
/// deadlock against the child's stdout.
pub fn spawn_stdin_writer(mut pipe: ChildStdin, bytes: Vec<u8>) -> JoinHandle<io::Result<()>> {
    thread::spawn(move || pipe.write_all(&bytes))
}

/// `Ok` when every byte was written, or when the child closed its stdin early
/// (it chose not to read the rest). Any other write error is returned.
pub fn join_stdin_writer(handle: JoinHandle<io::Result<()>>, program: &str) -> Result<()> {
    match handle.join() {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) if e.kind() == io::ErrorKind::BrokenPipe => Ok(()),
        Ok(Err(e)) => Err(e).with_context(|| format!("write stdin of {program:?}")),
        Err(_) => bail!("stdin writer for {program:?} panicked"),
    }
}

fn ensure_success(argv: &[String], out: &CommandOutput) -> Result<()> {
    if out.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&out.stderr);
    let tail: String = {
        let chars: Vec<char> = stderr.trim().chars().collect();
        let start = chars.len().saturating_sub(STDERR_TAIL);
        chars[start..].iter().collect()
    };
    bail!("{:?} exited with {}: {}", argv.first().map(String::as_str).unwrap_or(""), out.status, tail)
}

pub struct CommandFetcher {
    argv: Vec<String>,
}

impl CommandFetcher {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Fetcher for CommandFetcher {
    fn fetch(&self, source: &str) -> Result<String> {
        let out = run_captured(&self.argv, source, None)?;
        ensure_success(&self.argv, &out)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

pub struct CommandClassifier {
    argv: Vec<String>,
}

impl CommandClassifier {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Classifier for CommandClassifier {
    /// stdout is taken as JSON when it parses, else as a trimmed string.
    fn classify(&self, source: &str, text: &str) -> Result<Value> {
        let out = run_captured(&self.argv, source, Some(text.as_bytes().to_vec()))?;
        ensure_success(&self.argv, &out)?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

pub struct CommandNotifier {
    argv: Vec<String>,
}

impl CommandNotifier {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, event: &WatchEvent) -> Result<()> {
        let payload = serde_json::to_vec(event).context("encode watch event")?;
        let out = run_captured(&self.argv, event.source(), Some(payload))?;
        ensure_success(&self.argv, &out)
    }
}
