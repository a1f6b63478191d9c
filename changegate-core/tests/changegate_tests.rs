use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};

use changegate_core::services::state::StateStore;
use changegate_core::{
    ChangeGate, Decision, Fingerprint, FingerprintAlgorithm, GateError, GateOutcome,
    MemoryStateStore, Normalizer, RunReason, StoragePolicy,
};

fn gate(store: &MemoryStateStore) -> ChangeGate<MemoryStateStore> {
    ChangeGate::new(store.clone(), Normalizer::default())
}

/// A clock the test can move forward.
fn manual_clock(start: DateTime<Utc>) -> (Arc<Mutex<DateTime<Utc>>>, impl Fn() -> DateTime<Utc> + Send + Sync + 'static) {
    let now = Arc::new(Mutex::new(start));
    let handle = now.clone();
    (handle, move || *now.lock().unwrap())
}

fn h(text: &str) -> Fingerprint {
    Fingerprint::compute(FingerprintAlgorithm::Blake3, text.as_bytes())
}

/// Evaluate and, on RUN, commit as a caller whose downstream step succeeded.
fn tick(gate: &ChangeGate<MemoryStateStore>, text: &str) -> Decision {
    let session = gate.begin().expect("begin");
    let ev = session.evaluate(text).expect("evaluate");
    session.commit(&ev).expect("commit");
    ev.decision
}

#[test]
fn first_ever_call_runs() {
    let store = MemoryStateStore::new("broker");
    let ev = gate(&store).evaluate("Maintenance Oct 12").unwrap();
    assert_eq!(ev.decision, Decision::Run(RunReason::FirstSeen));
    assert!(ev.previous.is_none());
    // evaluate alone never writes
    assert!(store.snapshot().is_none());
    assert_eq!(store.write_count(), 0);
}

#[test]
fn identical_text_runs_then_skips() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert!(tick(&g, "cTrader maintenance on Saturday").is_run());
    assert_eq!(tick(&g, "cTrader maintenance on Saturday"), Decision::Skip);
    assert_eq!(store.write_count(), 1, "skip must not touch storage");
}

#[test]
fn different_text_runs_twice_and_stores_latest_hash() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert_eq!(tick(&g, "first notice"), Decision::Run(RunReason::FirstSeen));
    assert_eq!(tick(&g, "second notice"), Decision::Run(RunReason::Changed));
    assert_eq!(store.snapshot().unwrap().fingerprint, h("second notice"));
}

#[test]
fn three_day_scenario_tracks_timestamps() {
    let t1 = Utc.with_ymd_and_hms(2024, 10, 10, 6, 0, 0).unwrap();
    let t2 = Utc.with_ymd_and_hms(2024, 10, 11, 6, 0, 0).unwrap();
    let t3 = Utc.with_ymd_and_hms(2024, 10, 12, 6, 0, 0).unwrap();
    let (now, clock) = manual_clock(t1);
    let store = MemoryStateStore::new("broker");
    let g = gate(&store).with_clock(clock);

    assert!(tick(&g, "Maintenance Oct 12").is_run());
    let rec = store.snapshot().unwrap();
    assert_eq!(rec.fingerprint, h("Maintenance Oct 12"));
    assert_eq!(rec.last_changed_at, t1);

    *now.lock().unwrap() = t2;
    assert_eq!(tick(&g, "Maintenance Oct 12"), Decision::Skip);
    assert_eq!(store.snapshot().unwrap(), rec, "skip leaves state untouched");

    *now.lock().unwrap() = t3;
    assert_eq!(tick(&g, "Maintenance Oct 19"), Decision::Run(RunReason::Changed));
    let rec = store.snapshot().unwrap();
    assert_eq!(rec.fingerprint, h("Maintenance Oct 19"));
    assert_eq!(rec.last_changed_at, t3);
    assert_eq!(rec.source.as_deref(), Some("broker"));
}

#[test]
fn trailing_newline_is_not_a_change() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert!(tick(&g, "Text").is_run());
    assert_eq!(tick(&g, "Text\n"), Decision::Skip);
    assert_eq!(tick(&g, "  Text  \r\n\r\n"), Decision::Skip);
}

#[test]
fn interrupted_run_is_retried() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    {
        let session = g.begin().unwrap();
        let ev = session.evaluate("Crypto market is closed Sunday").unwrap();
        assert!(ev.should_run());
        // process "dies" here: session dropped without commit
    }
    assert!(store.snapshot().is_none());
    let ev = g.evaluate("Crypto market is closed Sunday").unwrap();
    assert_eq!(ev.decision, Decision::Run(RunReason::FirstSeen));
}

#[test]
fn failed_downstream_work_does_not_advance_state() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    let err = g
        .run_gated("page v1", |_| -> anyhow::Result<()> { anyhow::bail!("model quota exceeded") })
        .unwrap_err();
    assert!(matches!(err, GateError::Downstream(_)));
    assert!(store.snapshot().is_none());

    match g.run_gated("page v1", |ev| Ok(ev.fingerprint)).unwrap() {
        GateOutcome::Completed { record, output, .. } => assert_eq!(record.fingerprint, output),
        other => panic!("expected completion, got {other:?}"),
    }
    let mut called = false;
    let outcome = g
        .run_gated("page v1", |_| {
            called = true;
            Ok(())
        })
        .unwrap();
    assert!(matches!(outcome, GateOutcome::Skipped(_)));
    assert!(!called, "work must not run on skip");
}

#[test]
fn concurrent_invocation_is_rejected_without_mutation() {
    let store = MemoryStateStore::new("broker");
    let first = gate(&store);
    let second = gate(&store);

    let session = first.begin().unwrap();
    assert!(session.is_locked());
    let err = second.evaluate("anything").unwrap_err();
    assert!(matches!(err, GateError::LockContention { .. }), "got {err:?}");

    let ev = session.evaluate("anything").unwrap();
    session.commit(&ev).unwrap();
    // lock released on commit; the second run now sees the committed state
    assert_eq!(second.evaluate("anything").unwrap().decision, Decision::Skip);
}

#[test]
fn lock_is_released_on_error_paths() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert!(matches!(g.evaluate("   \n\t"), Err(GateError::EmptyInput)));
    // the failed evaluate above must not leave the slot locked
    let _guard = store.try_lock().expect("lock free again");
}

#[test]
fn empty_input_is_a_caller_error() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert!(matches!(g.evaluate(""), Err(GateError::EmptyInput)));
    assert!(matches!(g.evaluate("\u{200B}\n\u{FEFF}"), Err(GateError::EmptyInput)));
    assert_eq!(store.write_count(), 0);
}

#[test]
fn unreadable_state_fails_open_by_default() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    assert!(tick(&g, "same").is_run());

    store.set_fail_reads(true);
    let session = g.begin().unwrap();
    let ev = session.evaluate("same").unwrap();
    assert_eq!(ev.decision, Decision::Run(RunReason::StorageUnavailable));
    assert!(ev.warning.as_deref().unwrap_or("").contains("unreadable"));
    // commit still overwrites the slot so the next healthy run can skip
    session.commit(&ev).unwrap();
    store.set_fail_reads(false);
    assert_eq!(g.evaluate("same").unwrap().decision, Decision::Skip);
}

#[test]
fn unreadable_state_fails_closed_when_configured() {
    let store = MemoryStateStore::new("broker");
    store.set_fail_reads(true);
    let g = gate(&store).with_policy(StoragePolicy::FailClosed);
    assert_eq!(g.policy(), StoragePolicy::FailClosed);
    let err = g.evaluate("text").unwrap_err();
    assert!(matches!(err, GateError::StorageUnavailable(_)));
    assert_eq!(err.kind(), "storage_unavailable");
}

#[test]
fn write_failure_on_commit_is_surfaced() {
    let store = MemoryStateStore::new("broker");
    store.set_fail_writes(true);
    let g = gate(&store);
    let session = g.begin().unwrap();
    let ev = session.evaluate("text").unwrap();
    let err = session.commit(&ev).unwrap_err();
    assert!(matches!(err, GateError::StorageUnavailable(_)));
    assert!(store.snapshot().is_none());
    // next run re-classifies rather than skipping
    store.set_fail_writes(false);
    assert!(g.evaluate("text").unwrap().should_run());
}

#[test]
fn algorithm_switch_forces_one_rerun() {
    let store = MemoryStateStore::new("broker");
    assert!(tick(&gate(&store), "page").is_run());
    let sha = gate(&store).with_algorithm(FingerprintAlgorithm::Sha256);
    assert_eq!(tick(&sha, "page"), Decision::Run(RunReason::AlgorithmChanged));
    assert_eq!(tick(&sha, "page"), Decision::Skip);
    assert_eq!(store.snapshot().unwrap().fingerprint.algorithm(), FingerprintAlgorithm::Sha256);
}

#[test]
fn skip_commit_is_a_noop() {
    let store = MemoryStateStore::new("broker");
    let g = gate(&store);
    tick(&g, "x");
    let session = g.begin().unwrap();
    let ev = session.evaluate("x").unwrap();
    assert_eq!(session.commit(&ev).unwrap(), None);
    assert_eq!(store.write_count(), 1);
}

#[test]
fn evaluation_json_names_decision_and_reason() {
    let store = MemoryStateStore::new("broker");
    let ev = gate(&store).evaluate("hello").unwrap();
    let v = ev.to_json();
    assert_eq!(v["decision"], "run");
    assert_eq!(v["reason"], "first_seen");
    assert_eq!(v["source"], "broker");
    assert!(v["fingerprint"].as_str().unwrap().starts_with("blake3:"));
}
