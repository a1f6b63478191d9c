// src/main.rs
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use changegate_core::commands::{default_root, ensure_initialized, Commands};
use changegate_core::config::SourceConfig;
use changegate_core::services::watch::{LogbookNotifier, Notifier, WatchOutcome, WatchReport, Watcher};
use changegate_core::GateError;

mod external;

use external::{join_stdin_writer, spawn_stdin_writer, CommandClassifier, CommandFetcher, CommandNotifier};

/// `check`: the text changed and should be classified.
const EXIT_RUN: u8 = 10;
/// Another run holds the slot (EX_TEMPFAIL).
const EXIT_CONTENDED: u8 = 75;

#[derive(Parser, Debug)]
#[command(
    name = "changegate",
    about = "Gate expensive classification of a monitored page behind a content fingerprint"
)]
struct Cli {
    /// State root; defaults to $CHANGEGATE_ROOT or ./.changegate
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Create the root layout and a default config.toml
    Init,
    /// Print the fingerprint of some text
    Fingerprint {
        /// File to read; stdin when omitted or "-"
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        show_normalized: bool,
    },
    /// Decide RUN/SKIP without committing (exit 10 = run, 0 = skip)
    Check {
        #[arg(long)]
        source: String,
        #[arg(long)]
        input: Option<PathBuf>,
    },
    /// Gate a command: on RUN pipe the text into it, commit iff it exits 0
    Exec {
        #[arg(long)]
        source: String,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Fetch → gate → classify → notify for configured sources
    Run {
        #[arg(long)]
        source: Option<String>,
        #[arg(long, help = "Run one cycle then exit")]
        once: bool,
    },
    /// Show stored state
    Status {
        #[arg(long)]
        source: Option<String>,
    },
    /// Forget a source's state so its next run classifies again
    Reset {
        #[arg(long)]
        source: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let root = cli.root.clone().unwrap_or_else(default_root);

    match dispatch(&root, cli.command) {
        Ok(code) => code,
        Err(e) => {
            if let Some(GateError::LockContention { holder }) = e.downcast_ref::<GateError>() {
                eprintln!("[changegate] slot busy: {holder}");
                return ExitCode::from(EXIT_CONTENDED);
            }
            eprintln!("[changegate] error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(root: &Path, command: Cmd) -> Result<ExitCode> {
    match command {
        Cmd::Init => {
            let report = ensure_initialized(root)?;
            print_json(&json!({
                "root": report.root.display().to_string(),
                "created": report.created,
                "existed": report.existed,
            }))?;
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Fingerprint {
            input,
            show_normalized,
        } => {
            let cmds = Commands::open(root)?;
            let text = read_input(input.as_deref())?;
            let (fp, normalized) = cmds.fingerprint(&text)?;
            println!("{fp}");
            if show_normalized {
                println!("{normalized}");
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Check { source, input } => {
            let cmds = Commands::open(root)?;
            let text = read_input(input.as_deref())?;
            let evaluation = cmds.check(&source, &text)?;
            print_json(&evaluation.to_json())?;
            Ok(if evaluation.should_run() {
                ExitCode::from(EXIT_RUN)
            } else {
                ExitCode::SUCCESS
            })
        }
        Cmd::Exec {
            source,
            input,
            command,
        } => {
            let cmds = Commands::open(root)?;
            let text = read_input(input.as_deref())?;
            exec_gated(&cmds, &source, &text, &command)
        }
        Cmd::Run { source, once } => {
            let cmds = Commands::open(root)?;
            let sources = select_sources(&cmds, source.as_deref())?;
            if once {
                run_cycle(&cmds, &sources);
                return Ok(ExitCode::SUCCESS);
            }
            let interval = cmds.config().schedule.interval_seconds;
            loop {
                run_cycle(&cmds, &sources);
                tracing::info!(seconds = interval, "sleeping until next cycle");
                thread::sleep(Duration::from_secs(interval));
            }
        }
        Cmd::Status { source } => {
            let cmds = Commands::open(root)?;
            match source {
                Some(name) => {
                    let record = cmds.status(&name)?;
                    print_json(&json!({ "source": name, "record": record }))?;
                }
                None => print_json(&serde_json::to_value(cmds.statuses()?)?)?,
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::Reset { source } => {
            let cmds = Commands::open(root)?;
            let removed = cmds.reset(&source)?;
            print_json(&json!({ "source": source, "removed": removed }))?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Hold the slot lock across evaluate → command → commit.
fn exec_gated(cmds: &Commands, source: &str, text: &str, command: &[String]) -> Result<ExitCode> {
    let gate = cmds.gate(source)?;
    let session = gate.begin()?;
    let evaluation = session.evaluate(text)?;
    cmds.record("gate_evaluated", evaluation.to_json());

    if !evaluation.should_run() {
        eprintln!("[changegate] {source}: unchanged, skipping");
        return Ok(ExitCode::SUCCESS);
    }
    if let Some(w) = &evaluation.warning {
        eprintln!("[changegate] {source}: warning: {w}");
    }

    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("missing command after --"))?;
    let mut child = Command::new(program)
        .args(args)
        .env("CHANGEGATE_SOURCE", source)
        .env("CHANGEGATE_FINGERPRINT", evaluation.fingerprint.to_string())
        .stdin(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program:?}"))?;
    let writer = child
        .stdin
        .take()
        .map(|pipe| spawn_stdin_writer(pipe, text.as_bytes().to_vec()));
    let status = child.wait().with_context(|| format!("wait for {program:?}"))?;
    if let Some(handle) = writer {
        // The command may exit 0 on truncated input; never commit that.
        if let Err(e) = join_stdin_writer(handle, program) {
            cmds.record(
                "downstream_failed",
                json!({ "source": source, "status": status.code(), "message": format!("{e:#}") }),
            );
            return Err(e.context(format!("{source}: input not fully delivered; state not advanced")));
        }
    }

    if !status.success() {
        eprintln!("[changegate] {source}: command failed ({status}); state not advanced");
        cmds.record(
            "downstream_failed",
            json!({ "source": source, "status": status.code() }),
        );
        let code = status.code().and_then(|c| u8::try_from(c).ok()).unwrap_or(1);
        return Ok(ExitCode::from(code.max(1)));
    }

    match session.commit(&evaluation) {
        Ok(record) => {
            cmds.record("state_committed", json!({ "source": source, "record": record }));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            cmds.record("storage_warning", json!({ "source": source, "message": e.to_string() }));
            Err(e.into())
        }
    }
}

fn select_sources(cmds: &Commands, only: Option<&str>) -> Result<Vec<SourceConfig>> {
    let all = &cmds.config().sources;
    if all.is_empty() {
        bail!(
            "no [[sources]] configured in {}",
            cmds.root().join(changegate_core::config::CONFIG_FILE).display()
        );
    }
    match only {
        Some(name) => {
            let found = cmds
                .config()
                .source(name)
                .ok_or_else(|| anyhow!("source {name:?} is not configured"))?;
            Ok(vec![found.clone()])
        }
        None => Ok(all.clone()),
    }
}

fn run_cycle(cmds: &Commands, sources: &[SourceConfig]) {
    tracing::info!(at = %Utc::now().to_rfc3339(), sources = sources.len(), "watch cycle started");
    for source in sources {
        match run_source(cmds, source) {
            Ok(report) => {
                let line = report_json(&report);
                if let Err(e) = print_json(&line) {
                    tracing::warn!(error = %e, "could not print report");
                }
            }
            Err(e) => {
                tracing::error!(source = %source.name, error = %format!("{e:#}"), "watch run failed");
            }
        }
    }
}

fn run_source(cmds: &Commands, source: &SourceConfig) -> Result<WatchReport> {
    let gate = cmds.gate(&source.name)?;
    let fetcher = CommandFetcher::new(source.fetch.clone());
    let classifier = CommandClassifier::new(source.classify.clone());

    let mut notifiers: Vec<Box<dyn Notifier>> = vec![Box::new(LogbookNotifier::new(cmds.logbook_path()))];
    if let Some(argv) = &source.notify {
        notifiers.push(Box::new(CommandNotifier::new(argv.clone())));
    }

    let watcher = Watcher::new(&gate, &fetcher, &classifier, &notifiers)
        .with_relevance(cmds.relevance_for(&source.name));
    Ok(watcher.run_once()?)
}

fn report_json(report: &WatchReport) -> serde_json::Value {
    let result = match &report.outcome {
        WatchOutcome::Classified(v) | WatchOutcome::NotifyFailed(v) => Some(v.clone()),
        _ => None,
    };
    json!({
        "source": report.source,
        "outcome": report.outcome.name(),
        "result": result,
        "fingerprint": report.evaluation.as_ref().map(|e| e.fingerprint.to_string()),
        "committed": report.committed.is_some(),
        "warnings": report.warnings,
    })
}

fn read_input(input: Option<&Path>) -> Result<String> {
    match input {
        Some(p) if p != Path::new("-") => {
            fs::read_to_string(p).with_context(|| format!("read input {}", p.display()))
        }
        _ => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            Ok(buf)
        }
    }
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
