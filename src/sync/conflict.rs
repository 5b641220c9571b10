//! Conflict detection
//!
//! Timestamp-based divergence detection between a queued local change and
//! the current remote document. Detection is observational: conflicts are
//! logged for later review and the submission proceeds under the local-wins
//! strategy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::remote::DocumentStore;
use crate::storage::{read_json, write_json, StateStore};
use crate::types::OperationId;

const CONFLICTS_KEY: &str = "sync/conflicts";

/// Result of probing the remote store for divergence
#[derive(Debug, Clone)]
pub struct ConflictCheck {
    pub has_conflict: bool,
    pub remote_timestamp: Option<DateTime<Utc>>,
}

impl ConflictCheck {
    fn clear() -> Self {
        Self {
            has_conflict: false,
            remote_timestamp: None,
        }
    }
}

/// How a detected conflict is resolved.
///
/// Only local-wins is implemented: the queued operation proceeds regardless
/// of what was detected. The enum stays open for strategies that may be
/// added later (remote-wins, merge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ResolutionStrategy {
    LocalWins,
}

impl ResolutionStrategy {
    /// The strategy applied by the drain loop
    pub fn current() -> Self {
        ResolutionStrategy::LocalWins
    }
}

/// One detected divergence, appended to the conflict log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub operation_id: OperationId,
    pub kind_tag: String,
    pub document_id: String,
    pub local_timestamp: DateTime<Utc>,
    pub remote_timestamp: Option<DateTime<Utc>>,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Probe the remote document for a modification newer than the local one.
///
/// An absent remote document is not a conflict (the local change may be the
/// creation itself, or the remote copy was deleted - delete-wins is fine
/// under local-wins). A fetch failure is treated as no conflict: detection
/// must never block the drain.
pub async fn check_for_conflict(
    documents: &dyn DocumentStore,
    collection: &str,
    document_id: &str,
    local_timestamp: DateTime<Utc>,
) -> ConflictCheck {
    match documents.fetch(collection, document_id).await {
        Ok(Some(remote)) => match remote.updated_at {
            Some(remote_ts) if remote_ts > local_timestamp => ConflictCheck {
                has_conflict: true,
                remote_timestamp: Some(remote_ts),
            },
            remote_ts => ConflictCheck {
                has_conflict: false,
                remote_timestamp: remote_ts,
            },
        },
        Ok(None) => ConflictCheck::clear(),
        Err(e) => {
            tracing::debug!(collection, document_id, "conflict probe failed: {}", e);
            ConflictCheck::clear()
        }
    }
}

/// Append-only log of detected conflicts
pub struct ConflictLog {
    store: Arc<dyn StateStore>,
}

impl ConflictLog {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Append a record, stamping the detection time
    pub fn record(&self, mut record: ConflictRecord) {
        record.detected_at = Utc::now();
        tracing::warn!(
            operation = %record.operation_id,
            document = %record.document_id,
            "conflict detected: {}",
            record.reason
        );
        let mut records = self.list();
        records.push(record);
        let outcome = write_json(self.store.as_ref(), CONFLICTS_KEY, &records);
        if !outcome.is_written() {
            tracing::warn!("conflict log not persisted: {:?}", outcome);
        }
    }

    pub fn list(&self) -> Vec<ConflictRecord> {
        read_json(self.store.as_ref(), CONFLICTS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.list().len()
    }

    /// Wholesale clear; individual records are never mutated
    pub fn clear(&self) {
        let outcome = self.store.remove(CONFLICTS_KEY);
        if !outcome.is_written() {
            tracing::warn!("conflict log not cleared: {:?}", outcome);
        }
    }
}
