//! Snapshot cache
//!
//! Stores the full remote dataset so the next cold start renders instantly
//! instead of waiting on the network. Purely a bootstrap accelerator: it
//! has no coupling to the operation queue.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::storage::{read_json, write_json, StateStore, WriteError, WriteOutcome};
use crate::types::SyncConfig;

const DATA_KEY: &str = "snapshot/data";
const META_KEY: &str = "snapshot/meta";

/// The cached dataset: collection name to documents
pub type Dataset = BTreeMap<String, Vec<Value>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotMeta {
    saved_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    essential: bool,
}

/// How a save landed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotSaved {
    /// The complete dataset was stored
    Full,
    /// Capacity forced the reduced essential subset
    Essential,
}

/// Bootstrap dataset cache with expiry
pub struct SnapshotCache {
    store: Arc<dyn StateStore>,
    ttl: chrono::Duration,
    essential_per_collection: usize,
}

impl SnapshotCache {
    pub fn new(store: Arc<dyn StateStore>, config: &SyncConfig) -> Self {
        Self {
            store,
            ttl: chrono::Duration::from_std(config.snapshot_ttl)
                .unwrap_or_else(|_| chrono::Duration::days(7)),
            essential_per_collection: config.essential_records_per_collection,
        }
    }

    /// Store the dataset with expiry metadata. On a capacity failure the
    /// reduced essential subset (most recent records per collection) is
    /// stored instead.
    pub fn save(&self, dataset: &Dataset) -> Result<SnapshotSaved> {
        match write_json(self.store.as_ref(), DATA_KEY, dataset) {
            WriteOutcome::Written => {
                self.write_meta(false)?;
                Ok(SnapshotSaved::Full)
            }
            WriteOutcome::Failed(WriteError::QuotaExceeded) => {
                tracing::warn!("snapshot over capacity, falling back to essential subset");
                let reduced = essential_subset(dataset, self.essential_per_collection);
                write_json(self.store.as_ref(), DATA_KEY, &reduced).into_result()?;
                self.write_meta(true)?;
                Ok(SnapshotSaved::Essential)
            }
            WriteOutcome::Failed(WriteError::Backend(msg)) => Err(SyncError::Storage(msg)),
        }
    }

    /// Load the cached dataset; an expired snapshot is cleared and reported
    /// as absent
    pub fn load(&self) -> Result<Option<Dataset>> {
        let Some(meta) = read_json::<SnapshotMeta>(self.store.as_ref(), META_KEY)? else {
            return Ok(None);
        };
        if Utc::now() > meta.expires_at {
            tracing::debug!("snapshot expired, clearing");
            self.invalidate();
            return Ok(None);
        }
        read_json(self.store.as_ref(), DATA_KEY)
    }

    /// Explicit clear, used after structural changes upstream
    pub fn invalidate(&self) {
        for key in [DATA_KEY, META_KEY] {
            let outcome = self.store.remove(key);
            if !outcome.is_written() {
                tracing::warn!(key, "snapshot key not removed: {:?}", outcome);
            }
        }
    }

    fn write_meta(&self, essential: bool) -> Result<()> {
        let now = Utc::now();
        let meta = SnapshotMeta {
            saved_at: now,
            expires_at: now + self.ttl,
            essential,
        };
        write_json(self.store.as_ref(), META_KEY, &meta).into_result()
    }
}

/// Most recent `per_collection` records of each collection. Callers persist
/// newest-last, so the tail is the recent end.
fn essential_subset(dataset: &Dataset, per_collection: usize) -> Dataset {
    dataset
        .iter()
        .map(|(name, docs)| {
            let tail = docs.len().saturating_sub(per_collection);
            (name.clone(), docs[tail..].to_vec())
        })
        .collect()
}
