//! Operation queue
//!
//! The durable, validated, ordered list of pending mutations. Entries that
//! fail structural validation when read back are quarantined - moved aside
//! for inspection, never silently dropped - and the live queue is rewritten
//! without them.
//!
//! Persistence is best-effort: a failed durable write leaves the in-memory
//! queue authoritative for the rest of the process lifetime, and the drift
//! is visible through [`QueueHealth::write_failures`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SyncError};
use crate::media::MediaStore;
use crate::status::StatusBoard;
use crate::storage::{read_json, write_json, StateStore};
use crate::types::{MediaRefs, Operation, OperationId, OperationKind};

const QUEUE_KEY: &str = "sync/queue";
const QUARANTINE_KEY: &str = "sync/queue_quarantine";

/// Queue health snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub valid_count: usize,
    pub quarantined_count: usize,
    pub oldest_enqueued_at: Option<DateTime<Utc>>,
    pub newest_enqueued_at: Option<DateTime<Utc>>,
    /// Durable writes that did not land since the queue was opened
    pub write_failures: u64,
}

/// Durable list of pending mutations
pub struct OperationQueue {
    store: Arc<dyn StateStore>,
    media: Arc<MediaStore>,
    status: Arc<StatusBoard>,
    ops: Mutex<Vec<Operation>>,
    /// Set when the last durable write failed; the in-memory queue is then
    /// ahead of storage and wins over durable reads
    dirty: AtomicBool,
    write_failures: AtomicU64,
}

impl OperationQueue {
    /// Open the queue, sweeping invalid durable entries into quarantine
    pub fn open(
        store: Arc<dyn StateStore>,
        media: Arc<MediaStore>,
        status: Arc<StatusBoard>,
    ) -> Result<Self> {
        let queue = Self {
            store,
            media,
            status,
            ops: Mutex::new(Vec::new()),
            dirty: AtomicBool::new(false),
            write_failures: AtomicU64::new(0),
        };
        let valid = queue.sweep()?;
        queue.status.set_pending(valid.len());
        *queue.ops.lock() = valid;
        Ok(queue)
    }

    /// Append a validated operation and return its fresh id.
    ///
    /// Synchronous by contract - never waits on the network. Referenced
    /// media must already be staged; an absent blob rejects the enqueue so
    /// the queue can never hold an operation that cannot resolve its media.
    pub fn enqueue(&self, kind: OperationKind, media: MediaRefs) -> Result<OperationId> {
        kind.validate()?;
        for (_, blob) in media.iter() {
            if !self.media.contains(blob) {
                return Err(SyncError::BlobMissing(blob.to_string()));
            }
        }

        let op = Operation {
            id: OperationId::generate(),
            kind,
            media,
            enqueued_at: Utc::now(),
            retry_count: 0,
        };
        let id = op.id.clone();

        let mut ops = self.ops.lock();
        tracing::debug!(operation = %id, kind = op.kind.tag(), "enqueued operation");
        ops.push(op);
        self.persist_locked(&ops);
        self.status.set_pending(ops.len());
        Ok(id)
    }

    /// Remove the operation with the given id; removing twice is a no-op
    pub fn dequeue(&self, id: &OperationId) {
        let mut ops = self.ops.lock();
        let before = ops.len();
        ops.retain(|op| &op.id != id);
        if ops.len() != before {
            self.persist_locked(&ops);
            self.status.set_pending(ops.len());
        }
    }

    /// Increment the retry counter of an operation, if present
    pub fn increment_retry(&self, id: &OperationId) {
        let mut ops = self.ops.lock();
        if let Some(op) = ops.iter_mut().find(|op| &op.id == id) {
            op.retry_count += 1;
            self.persist_locked(&ops);
        }
    }

    /// All structurally valid queued operations.
    ///
    /// Reads durable storage, quarantining invalid entries and rewriting
    /// the durable queue without them. While a durable write failure is
    /// outstanding, the in-memory queue is ahead of storage: it wins, and a
    /// re-persist is attempted instead.
    pub fn list_valid(&self) -> Result<Vec<Operation>> {
        if self.dirty.load(Ordering::Acquire) {
            let ops = self.ops.lock();
            self.persist_locked(&ops);
            return Ok(ops.clone());
        }

        let valid = self.sweep()?;
        let mut ops = self.ops.lock();
        *ops = valid.clone();
        self.status.set_pending(ops.len());
        Ok(valid)
    }

    /// Current number of queued operations
    pub fn len(&self) -> usize {
        self.ops.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.lock().is_empty()
    }

    /// Quarantined raw entries, for inspection
    pub fn quarantined(&self) -> Result<Vec<Value>> {
        Ok(read_json(self.store.as_ref(), QUARANTINE_KEY)?.unwrap_or_default())
    }

    /// Drop all quarantined entries after inspection
    pub fn clear_quarantine(&self) -> Result<()> {
        self.store.remove(QUARANTINE_KEY).into_result()
    }

    /// Health snapshot for diagnostics
    pub fn health(&self) -> QueueHealth {
        let ops = self.ops.lock();
        QueueHealth {
            valid_count: ops.len(),
            quarantined_count: self.quarantined().map(|q| q.len()).unwrap_or(0),
            oldest_enqueued_at: ops.iter().map(|op| op.enqueued_at).min(),
            newest_enqueued_at: ops.iter().map(|op| op.enqueued_at).max(),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Read the durable queue, partition valid from invalid, quarantine the
    /// invalid, and rewrite the durable list if anything was quarantined.
    fn sweep(&self) -> Result<Vec<Operation>> {
        let raw = match self.store.read(QUEUE_KEY) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("queue storage unreadable, keeping in-memory view: {}", e);
                return Ok(self.ops.lock().clone());
            }
        };
        let Some(raw) = raw else {
            return Ok(Vec::new());
        };

        let entries: Vec<Value> = match serde_json::from_str(&raw) {
            Ok(Value::Array(entries)) => entries,
            Ok(other) => {
                // Not even a list: quarantine the whole value and start over
                tracing::warn!("queue storage held a non-list value, quarantining it");
                self.quarantine(vec![other]);
                self.persist_raw(&[]);
                return Ok(Vec::new());
            }
            Err(e) => {
                tracing::warn!("queue storage held unparseable JSON, quarantining it: {}", e);
                self.quarantine(vec![Value::String(raw)]);
                self.persist_raw(&[]);
                return Ok(Vec::new());
            }
        };

        let mut valid = Vec::with_capacity(entries.len());
        let mut invalid = Vec::new();
        for entry in entries {
            match serde_json::from_value::<Operation>(entry.clone()) {
                Ok(op) => valid.push(op),
                Err(e) => {
                    tracing::warn!("quarantining malformed queue entry: {}", e);
                    invalid.push(entry);
                }
            }
        }

        if !invalid.is_empty() {
            self.quarantine(invalid);
            self.persist_raw(&valid);
        }

        Ok(valid)
    }

    fn quarantine(&self, entries: Vec<Value>) {
        let mut held: Vec<Value> = read_json(self.store.as_ref(), QUARANTINE_KEY)
            .ok()
            .flatten()
            .unwrap_or_default();
        held.extend(entries);
        let outcome = write_json(self.store.as_ref(), QUARANTINE_KEY, &held);
        if !outcome.is_written() {
            tracing::warn!("quarantine store not persisted: {:?}", outcome);
        }
    }

    fn persist_raw(&self, ops: &[Operation]) {
        let outcome = write_json(self.store.as_ref(), QUEUE_KEY, &ops);
        match outcome {
            crate::storage::WriteOutcome::Written => {
                self.dirty.store(false, Ordering::Release);
            }
            failed => {
                tracing::warn!("queue not persisted: {:?}", failed);
                self.dirty.store(true, Ordering::Release);
                self.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn persist_locked(&self, ops: &[Operation]) {
        self.persist_raw(ops);
    }
}
