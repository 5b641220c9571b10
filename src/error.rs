//! Error types for fieldsync

use thiserror::Error;

/// Result type alias for fieldsync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Main error type for fieldsync
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Local storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Media blob not found: {0}")]
    BlobMissing(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sync worker is no longer running")]
    WorkerGone,
}

impl SyncError {
    /// Check if the error is transient and eligible for another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Remote(_) | SyncError::Timeout(_))
    }

    /// Check if the error is a local capacity failure (never retried)
    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::QuotaExceeded(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(SyncError::Remote("503".into()).is_retryable());
        assert!(SyncError::Timeout("submit".into()).is_retryable());
        assert!(!SyncError::Validation("empty id".into()).is_retryable());
        assert!(!SyncError::QuotaExceeded("media".into()).is_retryable());
    }

    #[test]
    fn test_quota_classification() {
        assert!(SyncError::QuotaExceeded("media".into()).is_quota());
        assert!(!SyncError::Storage("disk".into()).is_quota());
    }
}
