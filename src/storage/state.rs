//! The injected small-object store behind the sync services
//!
//! Every durable write reports an explicit [`WriteOutcome`] instead of
//! logging and moving on, so callers and tests can assert on persistence.
//! The queue and caches treat a failed write as best-effort persistence:
//! the in-memory effect stands for the process lifetime and the drift is
//! visible through their health reports.

use rusqlite::{params, ErrorCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Storage;
use crate::error::{Result, SyncError};

/// Why a durable write did not land
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Local storage capacity exhausted; never retried internally
    QuotaExceeded,
    /// Any other backend fault
    Backend(String),
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::QuotaExceeded => write!(f, "local storage quota exceeded"),
            WriteError::Backend(msg) => write!(f, "storage backend: {}", msg),
        }
    }
}

/// Explicit result of a durable small-object write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    Failed(WriteError),
}

impl WriteOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written)
    }

    /// Convert to a hard error, for call sites where persistence is required
    pub fn into_result(self) -> Result<()> {
        match self {
            WriteOutcome::Written => Ok(()),
            WriteOutcome::Failed(WriteError::QuotaExceeded) => {
                Err(SyncError::QuotaExceeded("small-object store".to_string()))
            }
            WriteOutcome::Failed(WriteError::Backend(msg)) => Err(SyncError::Storage(msg)),
        }
    }
}

/// Keyed string storage for queue, status, caches, conflicts, and snapshot
pub trait StateStore: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>>;

    fn write(&self, key: &str, value: &str) -> WriteOutcome;

    fn remove(&self, key: &str) -> WriteOutcome;

    /// Keys starting with the given prefix, for namespaced listings
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Read and deserialize a JSON value stored under `key`
pub fn read_json<T: DeserializeOwned>(store: &dyn StateStore, key: &str) -> Result<Option<T>> {
    match store.read(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

/// Serialize and write a JSON value under `key`
pub fn write_json<T: Serialize>(store: &dyn StateStore, key: &str, value: &T) -> WriteOutcome {
    match serde_json::to_string(value) {
        Ok(raw) => store.write(key, &raw),
        Err(e) => WriteOutcome::Failed(WriteError::Backend(e.to_string())),
    }
}

/// SQLite-backed implementation of [`StateStore`]
#[derive(Clone)]
pub struct SqliteStateStore {
    storage: Storage,
}

impl SqliteStateStore {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }
}

fn classify(err: rusqlite::Error) -> WriteError {
    if let rusqlite::Error::SqliteFailure(inner, _) = &err {
        if inner.code == ErrorCode::DiskFull {
            return WriteError::QuotaExceeded;
        }
    }
    WriteError::Backend(err.to_string())
}

impl StateStore for SqliteStateStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
        let conn = self.storage.connection();
        let mut stmt = conn.prepare_cached("SELECT value FROM kv_store WHERE key = ?")?;
        let mut rows = stmt.query(params![key])?;
        match rows.next()? {
            Some(row) => Ok(Some(row.get(0)?)),
            None => Ok(None),
        }
    }

    fn write(&self, key: &str, value: &str) -> WriteOutcome {
        let conn = self.storage.connection();
        let result = conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, CURRENT_TIMESTAMP)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value],
        );
        match result {
            Ok(_) => WriteOutcome::Written,
            Err(e) => WriteOutcome::Failed(classify(e)),
        }
    }

    fn remove(&self, key: &str) -> WriteOutcome {
        let conn = self.storage.connection();
        match conn.execute("DELETE FROM kv_store WHERE key = ?", params![key]) {
            Ok(_) => WriteOutcome::Written,
            Err(e) => WriteOutcome::Failed(classify(e)),
        }
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.storage.connection();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = conn.prepare_cached(
            "SELECT key FROM kv_store WHERE key LIKE ? ESCAPE '\\' ORDER BY key",
        )?;
        let keys = stmt
            .query_map(params![pattern], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStateStore {
        SqliteStateStore::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn test_write_read_remove() {
        let store = store();
        assert!(store.write("sync/status", r#"{"is_syncing":false}"#).is_written());
        assert_eq!(
            store.read("sync/status").unwrap().as_deref(),
            Some(r#"{"is_syncing":false}"#)
        );

        assert!(store.remove("sync/status").is_written());
        assert_eq!(store.read("sync/status").unwrap(), None);
        // Removing an absent key is not an error
        assert!(store.remove("sync/status").is_written());
    }

    #[test]
    fn test_overwrite_replaces_value() {
        let store = store();
        store.write("k", "one");
        store.write("k", "two");
        assert_eq!(store.read("k").unwrap().as_deref(), Some("two"));
    }

    #[test]
    fn test_keys_with_prefix() {
        let store = store();
        store.write("feedback/observations", "[]");
        store.write("feedback/route_summaries", "[]");
        store.write("sync/queue", "[]");

        let keys = store.keys_with_prefix("feedback/").unwrap();
        assert_eq!(
            keys,
            vec![
                "feedback/observations".to_string(),
                "feedback/route_summaries".to_string()
            ]
        );
    }

    #[test]
    fn test_json_helpers() {
        let store = store();
        let outcome = write_json(&store, "nums", &vec![1, 2, 3]);
        assert!(outcome.is_written());
        let back: Option<Vec<i32>> = read_json(&store, "nums").unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));

        let missing: Option<Vec<i32>> = read_json(&store, "absent").unwrap();
        assert_eq!(missing, None);
    }
}
