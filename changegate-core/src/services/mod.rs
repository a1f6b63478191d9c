// src/services/mod.rs

pub mod changegate;   // lock → evaluate → (caller works) → commit
pub mod fingerprint;  // blake3 / sha256 digests of normalized text
pub mod normalize;    // the fixed pre-hash transformation
pub mod relevance;    // keyword pre-filter before classification
pub mod state;        // StateStore seam: file slot + in-memory double
pub mod watch;        // fetch → gate → classify → notify for one source

// Public API
pub use changegate::ChangeGate;
pub use relevance::RelevanceFilter;
pub use state::{FileStateStore, MemoryStateStore, StateStore};
pub use watch::{Classifier, Fetcher, LogbookNotifier, Notifier, WatchEvent, WatchOutcome, WatchReport, Watcher};
