//! Remote store seams
//!
//! The engine consumes the remote document store and object store through
//! these traits; the host application injects its concrete backends. Both
//! stores are treated as at-least-once: the drain loop bounds every call
//! with its own timeout and treats a timeout like any other failed call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;

/// A document fetched from the remote store
#[derive(Debug, Clone)]
pub struct RemoteDocument {
    pub document: Value,
    /// Server-side last-modified time, when the backend tracks one
    pub updated_at: Option<DateTime<Utc>>,
}

/// Collection-oriented remote document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Add a document; returns the store-assigned document id
    async fn create(&self, collection: &str, document: Value) -> Result<String>;

    /// Apply a partial update to an existing document
    async fn update(&self, collection: &str, document_id: &str, changes: Value) -> Result<()>;

    /// Delete a document by id
    async fn delete(&self, collection: &str, document_id: &str) -> Result<()>;

    /// Fetch a document, `None` if absent
    async fn fetch(&self, collection: &str, document_id: &str) -> Result<Option<RemoteDocument>>;
}

/// Path-addressed remote binary store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload bytes under a path; returns a stable retrieval URL
    async fn upload(&self, path: &str, bytes: Vec<u8>, content_type: &str) -> Result<String>;

    /// Delete by retrieval URL; best-effort
    async fn delete(&self, url: &str) -> Result<()>;
}
