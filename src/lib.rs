//! fieldsync - offline synchronization engine for field observations
//!
//! A durable local operation queue, a media blob store, and a sync
//! orchestrator that drains pending mutations against an injected remote
//! store with priority ordering, bounded retry, and single-flight
//! execution.

pub mod diagnostics;
pub mod error;
pub mod feedback;
pub mod media;
pub mod queue;
pub mod remote;
pub mod snapshot;
pub mod status;
pub mod storage;
pub mod sync;
pub mod types;

pub use error::{Result, SyncError};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
