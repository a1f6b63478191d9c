use std::fs;

use chrono::Utc;
use tempfile::tempdir;

use changegate_core::services::state::STATE_SCHEMA_VERSION;
use changegate_core::utils::atomic::tmp_path_for;
use changegate_core::utils::lock::{FileLock, LockMetadata, read_lock_metadata};
use changegate_core::{
    ChangeGate, Decision, FileStateStore, Fingerprint, FingerprintAlgorithm, GateError, Normalizer,
    StateRecord, StateStore, StoreError,
};

fn record(text: &str) -> StateRecord {
    StateRecord {
        schema_version: STATE_SCHEMA_VERSION,
        fingerprint: Fingerprint::compute(FingerprintAlgorithm::Blake3, text.as_bytes()),
        last_changed_at: Utc::now(),
        source: Some("broker".to_string()),
        normalized_bytes: Some(text.len() as u64),
    }
}

#[test]
fn missing_slot_reads_as_none() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::open(dir.path().join("state"), "broker").unwrap();
    assert_eq!(store.read().unwrap(), None);
    assert!(!store.clear().unwrap());
}

#[test]
fn write_then_read_back_without_temp_leftovers() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::open(dir.path(), "broker").unwrap();
    let rec = record("Maintenance Oct 12");
    store.write(&rec).unwrap();

    assert_eq!(store.read().unwrap(), Some(rec.clone()));
    assert!(store.slot_path().is_file());
    assert!(!tmp_path_for(&store.slot_path()).exists());

    let raw: serde_json::Value = serde_json::from_slice(&fs::read(store.slot_path()).unwrap()).unwrap();
    assert_eq!(raw["fingerprint"], rec.fingerprint.to_string());
    assert!(raw["last_changed_at"].is_string());

    assert!(store.clear().unwrap());
    assert_eq!(store.read().unwrap(), None);
}

#[test]
fn unknown_fields_and_missing_optionals_still_decode() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::open(dir.path(), "broker").unwrap();
    let fp = Fingerprint::compute(FingerprintAlgorithm::Blake3, b"x");
    let text = format!(
        r#"{{"fingerprint":"{fp}","last_changed_at":"2024-10-12T06:00:00Z","written_by":"v2","extra":{{"a":1}}}}"#
    );
    fs::write(store.slot_path(), text).unwrap();
    let rec = store.read().unwrap().unwrap();
    assert_eq!(rec.fingerprint, fp);
    assert_eq!(rec.schema_version, STATE_SCHEMA_VERSION);
    assert_eq!(rec.source, None);
}

#[test]
fn corrupt_slot_is_reported_and_gate_fails_open() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::open(dir.path(), "broker").unwrap();
    fs::write(store.slot_path(), b"{ not json").unwrap();
    assert!(matches!(store.read(), Err(StoreError::Corrupt { .. })));

    let gate = ChangeGate::new(store.clone(), Normalizer::default());
    let session = gate.begin().unwrap();
    let ev = session.evaluate("page").unwrap();
    assert!(ev.should_run());
    assert!(ev.warning.is_some());
    session.commit(&ev).unwrap();
    // the commit replaced the corrupt record
    assert_eq!(gate.evaluate("page").unwrap().decision, Decision::Skip);
}

#[test]
fn second_store_on_same_slot_sees_contention() {
    let dir = tempdir().unwrap();
    let a = FileStateStore::open(dir.path(), "broker").unwrap();
    let b = FileStateStore::open(dir.path(), "broker").unwrap();

    let held = a.try_lock().unwrap();
    assert!(held.is_held());
    match b.try_lock() {
        Err(StoreError::Locked { holder }) => {
            assert!(holder.contains(&std::process::id().to_string()), "holder: {holder}");
        }
        other => panic!("expected Locked, got {other:?}"),
    }
    let meta = read_lock_metadata(&a.lock_path()).unwrap();
    assert_eq!(meta.pid, std::process::id());
    assert_eq!(meta.source.as_deref(), Some("broker"));

    drop(held);
    let _again = b.try_lock().expect("released on drop");
}

#[test]
fn gate_over_files_reports_lock_contention() {
    let dir = tempdir().unwrap();
    let a = ChangeGate::new(FileStateStore::open(dir.path(), "broker").unwrap(), Normalizer::default());
    let b = ChangeGate::new(FileStateStore::open(dir.path(), "broker").unwrap(), Normalizer::default());

    let session = a.begin().unwrap();
    assert!(matches!(b.evaluate("page"), Err(GateError::LockContention { .. })));
    let ev = session.evaluate("page").unwrap();
    session.commit(&ev).unwrap();
    assert_eq!(b.evaluate("page\n").unwrap().decision, Decision::Skip);
}

#[test]
fn stale_lock_file_does_not_block() {
    let dir = tempdir().unwrap();
    let store = FileStateStore::open(dir.path(), "broker").unwrap();
    // leftover from a killed process: file exists, nobody holds the OS lock
    fs::write(store.lock_path(), br#"{"pid":1,"user":"ghost","started_at":"2020-01-01T00:00:00Z","run_id":"x"}"#).unwrap();
    let _lock = store.try_lock().expect("stale lock file is reacquired");
    assert_eq!(read_lock_metadata(&store.lock_path()).unwrap().pid, std::process::id());
}

#[test]
fn source_names_are_validated() {
    let dir = tempdir().unwrap();
    for bad in ["", "..", "../escape", "a/b", ".hidden", "with space", "a\\b"] {
        assert!(
            matches!(FileStateStore::open(dir.path(), bad), Err(StoreError::InvalidSource(_))),
            "{bad:?} should be rejected"
        );
    }
    for good in ["broker", "ftmo-trading-updates", "feed_2.v1"] {
        assert!(FileStateStore::open(dir.path(), good).is_ok(), "{good:?}");
    }
}

#[test]
fn list_returns_slot_names_sorted() {
    let dir = tempdir().unwrap();
    assert!(FileStateStore::list(&dir.path().join("missing")).unwrap().is_empty());
    for name in ["zeta", "alpha"] {
        FileStateStore::open(dir.path(), name).unwrap().write(&record(name)).unwrap();
    }
    fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
    // a lock file alone is not a slot
    let _lock = FileStateStore::open(dir.path(), "locked-only").unwrap().try_lock().unwrap();
    assert_eq!(FileStateStore::list(dir.path()).unwrap(), vec!["alpha", "zeta"]);
}

#[test]
fn file_lock_records_its_holder() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("broker.lock");
    let lock = FileLock::acquire(&path, LockMetadata::current(Some("broker"))).unwrap();
    assert_eq!(lock.path(), path.as_path());
    let on_disk = read_lock_metadata(&path).unwrap();
    assert_eq!(on_disk.run_id, lock.metadata().run_id);
    assert!(lock.metadata().display_summary().starts_with(&format!("pid {}", std::process::id())));

    let err = FileLock::acquire(&path, LockMetadata::current(None)).unwrap_err();
    assert!(matches!(err, StoreError::Locked { .. }));
}
