use std::fs;
use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

use changegate_core::{FileStateStore, StateStore};

fn changegate(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("changegate").unwrap();
    cmd.arg("--root").arg(root).env_remove("CHANGEGATE_ROOT").env("RUST_LOG", "warn");
    cmd
}

fn stdout_json(out: &std::process::Output) -> Value {
    serde_json::from_slice(&out.stdout).unwrap()
}

#[test]
fn init_is_idempotent() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("root");
    changegate(&root)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));
    assert!(root.join("config.toml").is_file());
    assert!(root.join("state").is_dir());

    let out = changegate(&root).arg("init").output().unwrap();
    assert!(out.status.success());
    assert_eq!(stdout_json(&out)["created"], serde_json::json!([]));
}

#[test]
fn fingerprint_ignores_formatting_noise() {
    let dir = tempdir().unwrap();
    let a = changegate(dir.path())
        .arg("fingerprint")
        .write_stdin("Maintenance  Oct 12\r\n")
        .output()
        .unwrap();
    let b = changegate(dir.path())
        .arg("fingerprint")
        .write_stdin("Maintenance Oct 12")
        .output()
        .unwrap();
    assert!(a.status.success());
    assert_eq!(a.stdout, b.stdout);
    assert!(String::from_utf8_lossy(&a.stdout).starts_with("blake3:"));

    changegate(dir.path())
        .args(["fingerprint", "--show-normalized"])
        .write_stdin("  Crypto   market is closed  \n")
        .assert()
        .success()
        .stdout(predicate::str::contains("\nCrypto market is closed\n"));
}

#[test]
fn empty_input_fails() {
    let dir = tempdir().unwrap();
    changegate(dir.path())
        .args(["check", "--source", "broker"])
        .write_stdin(" \n\t")
        .assert()
        .failure()
        .stderr(predicate::str::contains("empty"));
}

#[test]
fn check_never_commits_and_exec_commits_on_success() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let page = root.join("page.txt");
    fs::write(&page, "cTrader maintenance on Saturday\n").unwrap();
    let page = page.to_str().unwrap();

    for _ in 0..2 {
        changegate(root)
            .args(["check", "--source", "broker", "--input", page])
            .assert()
            .code(10)
            .stdout(predicate::str::contains("first_seen"));
    }

    let received = root.join("received.txt");
    changegate(root)
        .args(["exec", "--source", "broker", "--input", page, "--", "sh", "-c"])
        .arg(format!("cat > '{}'", received.display()))
        .assert()
        .success();
    assert_eq!(fs::read_to_string(&received).unwrap(), "cTrader maintenance on Saturday\n");

    changegate(root)
        .args(["check", "--source", "broker", "--input", page])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("\"skip\""));

    // unchanged: the command is not run at all
    let marker = root.join("marker");
    changegate(root)
        .args(["exec", "--source", "broker", "--input", page, "--", "touch"])
        .arg(&marker)
        .assert()
        .success();
    assert!(!marker.exists());
}

#[test]
fn failed_command_does_not_advance_state() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    changegate(root)
        .args(["exec", "--source", "broker", "--", "sh", "-c", "cat >/dev/null; exit 3"])
        .write_stdin("Crypto market is closed")
        .assert()
        .code(3);
    changegate(root)
        .args(["check", "--source", "broker"])
        .write_stdin("Crypto market is closed")
        .assert()
        .code(10);
}

#[test]
fn held_slot_exits_with_contention_code() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    let store = FileStateStore::open(root.join("state"), "broker").unwrap();
    let _held = store.try_lock().unwrap();

    changegate(root)
        .args(["check", "--source", "broker"])
        .write_stdin("page")
        .assert()
        .code(75)
        .stderr(predicate::str::contains("slot busy"));
}

#[test]
fn status_and_reset() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    changegate(root)
        .args(["exec", "--source", "broker", "--", "true"])
        .write_stdin("Maintenance")
        .assert()
        .success();

    let out = changegate(root).args(["status", "--source", "broker"]).output().unwrap();
    let status = stdout_json(&out);
    assert!(status["record"]["fingerprint"].as_str().unwrap().starts_with("blake3:"));

    let out = changegate(root).arg("status").output().unwrap();
    assert_eq!(stdout_json(&out)[0]["source"], "broker");

    let out = changegate(root).args(["reset", "--source", "broker"]).output().unwrap();
    assert_eq!(stdout_json(&out)["removed"], true);
    changegate(root)
        .args(["check", "--source", "broker"])
        .write_stdin("Maintenance")
        .assert()
        .code(10);
}

#[test]
fn run_once_classifies_then_skips() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("config.toml"),
        r#"
[logbook]
enabled = true

[[sources]]
name = "broker"
fetch = ["sh", "-c", "echo 'Crypto market is closed this Sunday'"]
classify = ["sh", "-c", "cat >/dev/null; echo '{\"closed\": true}'"]
"#,
    )
    .unwrap();

    let out = changegate(root).args(["run", "--once"]).output().unwrap();
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let report = stdout_json(&out);
    assert_eq!(report["outcome"], "classified");
    assert_eq!(report["result"]["closed"], true);
    assert_eq!(report["committed"], true);

    let out = changegate(root).args(["run", "--once", "--source", "broker"]).output().unwrap();
    assert_eq!(stdout_json(&out)["outcome"], "skipped");

    let log = fs::read_to_string(root.join("logbook/events.jsonl")).unwrap();
    assert!(log.lines().any(|l| l.contains("\"classified\"")));
}

#[test]
fn run_without_sources_fails() {
    let dir = tempdir().unwrap();
    changegate(dir.path())
        .args(["run", "--once"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no [[sources]]"));
}

#[test]
fn failed_notify_command_keeps_page_pending() {
    let dir = tempdir().unwrap();
    let root = dir.path();
    fs::write(
        root.join("config.toml"),
        r#"
[[sources]]
name = "broker"
fetch = ["sh", "-c", "echo 'cTrader maintenance Saturday'"]
classify = ["sh", "-c", "cat >/dev/null; echo '{\"window\": \"sat\"}'"]
notify = ["sh", "-c", "cat >/dev/null; exit 1"]
"#,
    )
    .unwrap();

    for _ in 0..2 {
        let out = changegate(root).args(["run", "--once"]).output().unwrap();
        let report = stdout_json(&out);
        assert_eq!(report["outcome"], "notify_failed");
        assert_eq!(report["committed"], false);
        assert_eq!(report["result"]["window"], "sat");
    }
    let out = changegate(root).args(["status", "--source", "broker"]).output().unwrap();
    assert!(stdout_json(&out)["record"].is_null());
}
