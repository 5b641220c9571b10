//! Sync status service
//!
//! The process-wide `{is_syncing, last_sync, pending_count}` record, owned
//! by one service object instead of a global. Mutated by the orchestrator
//! and the queue, read by any collaborator; persisted best-effort so the
//! last sync time survives restarts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::storage::{read_json, write_json, StateStore};
use crate::types::SyncStatus;

const STATUS_KEY: &str = "sync/status";

/// Holder of the observable [`SyncStatus`]
pub struct StatusBoard {
    store: Arc<dyn StateStore>,
    inner: Mutex<SyncStatus>,
}

impl StatusBoard {
    /// Load persisted status. A crash mid-drain can leave `is_syncing=true`
    /// behind; a fresh process is never draining, so the flag resets.
    pub fn open(store: Arc<dyn StateStore>) -> Self {
        let mut status: SyncStatus = read_json(store.as_ref(), STATUS_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        status.is_syncing = false;
        Self {
            store,
            inner: Mutex::new(status),
        }
    }

    pub fn get(&self) -> SyncStatus {
        self.inner.lock().clone()
    }

    pub fn set_syncing(&self, syncing: bool) {
        let mut inner = self.inner.lock();
        inner.is_syncing = syncing;
        self.persist(&inner);
    }

    /// Mark a drain pass finished at `at`
    pub fn drain_finished(&self, at: DateTime<Utc>) {
        let mut inner = self.inner.lock();
        inner.is_syncing = false;
        inner.last_sync = Some(at);
        self.persist(&inner);
    }

    /// Mirror the queue length
    pub fn set_pending(&self, count: usize) {
        let mut inner = self.inner.lock();
        inner.pending_count = count;
        self.persist(&inner);
    }

    fn persist(&self, status: &SyncStatus) {
        let outcome = write_json(self.store.as_ref(), STATUS_KEY, status);
        if !outcome.is_written() {
            tracing::warn!("sync status not persisted: {:?}", outcome);
        }
    }
}
