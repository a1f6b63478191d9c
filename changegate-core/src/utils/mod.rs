// src/utils/mod.rs

pub mod atomic;   // temp file + rename
pub mod lock;     // per-slot advisory lock
pub mod logbook;  // append-only JSONL audit trail
pub mod path;     // slot names and root containment
