//! Sync orchestration
//!
//! The drain engine, the background worker that triggers it, and the
//! observational conflict detector.

mod conflict;
mod engine;
mod worker;

pub use conflict::{
    check_for_conflict, ConflictCheck, ConflictLog, ConflictRecord, ResolutionStrategy,
};
pub use engine::{strip_offline_fields, SyncEngine};
pub use worker::{SyncCommand, SyncHandle, SyncWorker};
