//! Aggregated health reporting over the sync services

use serde::Serialize;

use crate::media::MediaStore;
use crate::queue::{OperationQueue, QueueHealth};
use crate::status::StatusBoard;
use crate::sync::ConflictLog;
use crate::types::SyncStatus;

/// One view over queue, media store, status, and conflict log
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub queue: QueueHealth,
    pub media_bytes: u64,
    pub media_blobs: usize,
    pub status: SyncStatus,
    pub conflicts_logged: usize,
}

/// Collect a health report. Media store failures degrade to zeroes rather
/// than failing the report; diagnostics must stay available when storage
/// misbehaves.
pub fn collect(
    queue: &OperationQueue,
    media: &MediaStore,
    status: &StatusBoard,
    conflicts: &ConflictLog,
) -> HealthReport {
    HealthReport {
        queue: queue.health(),
        media_bytes: media.total_size().unwrap_or(0),
        media_blobs: media.blob_count().unwrap_or(0),
        status: status.get(),
        conflicts_logged: conflicts.count(),
    }
}
