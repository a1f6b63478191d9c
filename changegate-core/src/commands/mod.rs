// src/commands/mod.rs
pub mod init;
mod api;

pub use api::{Commands, SlotStatus};

pub use init::{InitReport, default_root, ensure_initialized};
