//! Local feedback cache
//!
//! Mirrors documents of unconfirmed operations so the UI can render
//! "pending" records the instant they are captured, before the orchestrator
//! confirms them remotely. Entries are tagged with their originating
//! operation id and removed one by one as operations confirm - never
//! bulk-cleared outside an explicit reset.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::Result;
use crate::storage::{read_json, write_json, StateStore};
use crate::types::OperationId;

const FEEDBACK_PREFIX: &str = "feedback/";

/// Document field carrying the pending-operation tag
pub const PENDING_TAG: &str = "_pending_op";

/// A mirrored document, tagged by its originating operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub operation_id: OperationId,
    pub document: Value,
}

/// Change notification emitted on every cache mutation
#[derive(Debug, Clone)]
pub enum FeedbackEvent {
    Added {
        collection: String,
        operation_id: OperationId,
    },
    Removed {
        collection: String,
        operation_id: OperationId,
    },
    Reset,
}

/// Durable mirror of unconfirmed documents, per collection
pub struct FeedbackCache {
    store: Arc<dyn StateStore>,
    entries: Mutex<BTreeMap<String, Vec<CacheEntry>>>,
    events: broadcast::Sender<FeedbackEvent>,
}

impl FeedbackCache {
    /// Load all persisted collections
    pub fn open(store: Arc<dyn StateStore>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for key in store.keys_with_prefix(FEEDBACK_PREFIX)? {
            let collection = key[FEEDBACK_PREFIX.len()..].to_string();
            match read_json::<Vec<CacheEntry>>(store.as_ref(), &key) {
                Ok(Some(list)) => {
                    entries.insert(collection, list);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(collection = %collection, "unreadable feedback cache entry dropped: {}", e);
                }
            }
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            store,
            entries: Mutex::new(entries),
            events,
        })
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<FeedbackEvent> {
        self.events.subscribe()
    }

    /// Mirror a document under its originating operation id. The stored
    /// copy carries the pending tag so consumers can mark it as such.
    pub fn add(&self, collection: &str, operation_id: &OperationId, mut document: Value) {
        if let Value::Object(map) = &mut document {
            map.insert(
                PENDING_TAG.to_string(),
                Value::String(operation_id.to_string()),
            );
        }
        let mut entries = self.entries.lock();
        let list = entries.entry(collection.to_string()).or_default();
        list.push(CacheEntry {
            operation_id: operation_id.clone(),
            document,
        });
        self.persist(collection, list);
        drop(entries);

        let _ = self.events.send(FeedbackEvent::Added {
            collection: collection.to_string(),
            operation_id: operation_id.clone(),
        });
    }

    /// Remove the entry tagged with `operation_id`; no-op if absent
    pub fn remove(&self, collection: &str, operation_id: &OperationId) {
        let mut entries = self.entries.lock();
        let mut removed = false;
        if let Some(list) = entries.get_mut(collection) {
            let before = list.len();
            list.retain(|e| &e.operation_id != operation_id);
            removed = list.len() != before;
            if removed {
                self.persist(collection, list);
            }
        }
        drop(entries);

        if removed {
            let _ = self.events.send(FeedbackEvent::Removed {
                collection: collection.to_string(),
                operation_id: operation_id.clone(),
            });
        }
    }

    /// All mirrored documents of a collection, in insertion order
    pub fn list(&self, collection: &str) -> Vec<Value> {
        self.entries
            .lock()
            .get(collection)
            .map(|list| list.iter().map(|e| e.document.clone()).collect())
            .unwrap_or_default()
    }

    /// Total mirrored entries across all collections
    pub fn len(&self) -> usize {
        self.entries.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Debug/reset escape hatch: clears everything
    pub fn reset(&self) {
        let mut entries = self.entries.lock();
        for collection in entries.keys() {
            let outcome = self
                .store
                .remove(&format!("{}{}", FEEDBACK_PREFIX, collection));
            if !outcome.is_written() {
                tracing::warn!(collection = %collection, "feedback cache key not removed");
            }
        }
        entries.clear();
        drop(entries);
        let _ = self.events.send(FeedbackEvent::Reset);
    }

    fn persist(&self, collection: &str, list: &[CacheEntry]) {
        let key = format!("{}{}", FEEDBACK_PREFIX, collection);
        let outcome = write_json(self.store.as_ref(), &key, &list);
        if !outcome.is_written() {
            tracing::warn!(collection, "feedback cache not persisted: {:?}", outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{SqliteStateStore, Storage};
    use serde_json::json;

    fn cache() -> (Arc<SqliteStateStore>, FeedbackCache) {
        let store = Arc::new(SqliteStateStore::new(Storage::open_in_memory().unwrap()));
        let cache = FeedbackCache::open(store.clone()).unwrap();
        (store, cache)
    }

    #[test]
    fn test_add_list_remove() {
        let (_, cache) = cache();
        let op = OperationId::generate();
        cache.add("observations", &op, json!({"category": "pest"}));

        let docs = cache.list("observations");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["category"], "pest");
        assert_eq!(docs[0][PENDING_TAG], op.to_string());

        cache.remove("observations", &op);
        assert!(cache.list("observations").is_empty());
        // Removing again is a no-op
        cache.remove("observations", &op);
    }

    #[test]
    fn test_remove_leaves_other_entries() {
        let (_, cache) = cache();
        let a = OperationId::generate();
        let b = OperationId::generate();
        cache.add("observations", &a, json!({"n": 1}));
        cache.add("observations", &b, json!({"n": 2}));

        cache.remove("observations", &a);
        let docs = cache.list("observations");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0]["n"], 2);
    }

    #[test]
    fn test_survives_reopen() {
        let (store, cache) = cache();
        let op = OperationId::generate();
        cache.add("prescriptions", &op, json!({"product": "copper"}));

        let reopened = FeedbackCache::open(store).unwrap();
        assert_eq!(reopened.list("prescriptions").len(), 1);
    }

    #[test]
    fn test_events_emitted() {
        let (_, cache) = cache();
        let mut rx = cache.subscribe();
        let op = OperationId::generate();
        cache.add("observations", &op, json!({}));
        cache.remove("observations", &op);

        assert!(matches!(rx.try_recv().unwrap(), FeedbackEvent::Added { .. }));
        assert!(matches!(
            rx.try_recv().unwrap(),
            FeedbackEvent::Removed { .. }
        ));
    }

    #[test]
    fn test_reset_clears_everything() {
        let (store, cache) = cache();
        cache.add("observations", &OperationId::generate(), json!({}));
        cache.add("route_summaries", &OperationId::generate(), json!({}));
        cache.reset();
        assert!(cache.is_empty());

        let reopened = FeedbackCache::open(store).unwrap();
        assert!(reopened.is_empty());
    }
}
