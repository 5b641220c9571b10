//! Media blob store
//!
//! Camera and microphone captures exist first as transient in-memory
//! buffers; operations queued while offline must survive restarts, so
//! referenced media is copied into durable local storage before the
//! operation counts as safely enqueued. Blobs live as flat files named by
//! their [`BlobId`] under one base directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::{sleep, timeout};

use crate::error::{Result, SyncError};
use crate::types::{BlobId, MediaKind, SyncConfig};

/// Best-effort estimate of available local space for media.
///
/// Hosts with a real probe (statvfs, platform quota API) inject one; the
/// default reports unknown, and unknown space never blocks a write.
pub trait SpaceProbe: Send + Sync {
    fn available_bytes(&self) -> Option<u64>;
}

/// Default probe: available space unknown
pub struct UnknownSpace;

impl SpaceProbe for UnknownSpace {
    fn available_bytes(&self) -> Option<u64> {
        None
    }
}

/// Space required to store `len` bytes, with the 1.5x safety margin
pub fn required_space(len: usize) -> u64 {
    len as u64 + (len as u64) / 2
}

fn is_quota_io(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::StorageFull | std::io::ErrorKind::QuotaExceeded
    )
}

/// Durable local storage for captured binary media
pub struct MediaStore {
    base_dir: PathBuf,
    probe: Arc<dyn SpaceProbe>,
    write_attempts: u32,
    attempt_timeout: Duration,
    backoff_base: Duration,
}

impl MediaStore {
    /// Open the store rooted at `base_dir`, creating it if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)
            .map_err(|e| SyncError::Storage(format!("Failed to create media dir: {}", e)))?;
        let config = SyncConfig::default();
        Ok(Self {
            base_dir,
            probe: Arc::new(UnknownSpace),
            write_attempts: config.blob_write_attempts,
            attempt_timeout: config.blob_attempt_timeout,
            backoff_base: config.blob_backoff_base,
        })
    }

    /// Replace the available-space probe
    pub fn with_probe(mut self, probe: Arc<dyn SpaceProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Apply the write retry policy from a [`SyncConfig`]
    pub fn with_config(mut self, config: &SyncConfig) -> Self {
        self.write_attempts = config.blob_write_attempts;
        self.attempt_timeout = config.blob_attempt_timeout;
        self.backoff_base = config.blob_backoff_base;
        self
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    /// Stage bytes into durable storage and return the new blob id.
    ///
    /// Insufficient estimated space fails with `QuotaExceeded` before any
    /// write attempt. Transient write failures are retried with exponential
    /// backoff; quota-class failures abort immediately. Each attempt is
    /// bounded by its own timeout so a stalled backend cannot block the
    /// caller.
    pub async fn put(&self, bytes: &[u8], kind: MediaKind) -> Result<BlobId> {
        let required = required_space(bytes.len());
        if let Some(available) = self.probe.available_bytes() {
            if required > available {
                return Err(SyncError::QuotaExceeded(format!(
                    "blob needs {} bytes (with margin), {} available",
                    required, available
                )));
            }
        }

        let id = BlobId::generate(kind);
        let path = self.blob_path(&id);

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match timeout(self.attempt_timeout, tokio::fs::write(&path, bytes)).await {
                Ok(Ok(())) => {
                    tracing::debug!(blob = %id, size = bytes.len(), "staged media blob");
                    return Ok(id);
                }
                Ok(Err(e)) if is_quota_io(&e) => {
                    return Err(SyncError::QuotaExceeded(e.to_string()));
                }
                Ok(Err(e)) if attempt >= self.write_attempts => {
                    return Err(SyncError::Storage(format!(
                        "blob write failed after {} attempts: {}",
                        attempt, e
                    )));
                }
                Ok(Err(e)) => {
                    tracing::warn!(blob = %id, attempt, "blob write failed: {}", e);
                }
                Err(_) if attempt >= self.write_attempts => {
                    return Err(SyncError::Timeout(format!(
                        "blob write timed out after {} attempts",
                        attempt
                    )));
                }
                Err(_) => {
                    tracing::warn!(blob = %id, attempt, "blob write attempt timed out");
                }
            }
            sleep(self.backoff_base * 2u32.pow(attempt - 1)).await;
        }
    }

    /// Fetch blob bytes, `None` if absent
    pub async fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.blob_path(id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a blob; absence is not an error
    pub async fn delete(&self, id: &BlobId) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob is currently present (used at enqueue time)
    pub fn contains(&self, id: &BlobId) -> bool {
        self.blob_path(id).exists()
    }

    /// Total bytes held by the store
    pub fn total_size(&self) -> Result<u64> {
        let mut total = 0u64;
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if entry.path().is_file() {
                total += entry.metadata()?.len();
            }
        }
        Ok(total)
    }

    /// Number of blobs held by the store
    pub fn blob_count(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.base_dir)? {
            if entry?.path().is_file() {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Remove blobs older than the retention window, regardless of whether
    /// anything still references them. Bounded-growth safety valve.
    pub fn purge_older_than(&self, age: Duration) -> Result<usize> {
        let cutoff = Utc::now().timestamp_millis() - age.as_millis() as i64;
        let mut removed = 0;
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let id = BlobId::from(name);
            let Some(created) = id.created_at_millis() else {
                continue;
            };
            if created < cutoff {
                std::fs::remove_file(&path)?;
                tracing::debug!(blob = name, "purged expired media blob");
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

/// Deterministic remote object path for an uploaded blob:
/// `media/{owner}/{field}/{plot}/{millis}_{kind}.{ext}`
pub fn remote_media_path(owner: &str, field: &str, plot: &str, kind: MediaKind) -> String {
    format!(
        "media/{}/{}/{}/{}_{}.{}",
        owner,
        field,
        plot,
        Utc::now().timestamp_millis(),
        kind.as_str(),
        kind.extension()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FixedProbe(u64);

    impl SpaceProbe for FixedProbe {
        fn available_bytes(&self) -> Option<u64> {
            Some(self.0)
        }
    }

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path()).unwrap();

        let bytes = b"not actually a jpeg".to_vec();
        let id = store.put(&bytes, MediaKind::Photo).await.unwrap();
        assert_eq!(id.kind(), Some(MediaKind::Photo));
        assert!(store.contains(&id));

        let back = store.get(&id).await.unwrap();
        assert_eq!(back.as_deref(), Some(bytes.as_slice()));

        store.delete(&id).await.unwrap();
        assert_eq!(store.get(&id).await.unwrap(), None);
        // Idempotent
        store.delete(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_quota_rejected_before_any_write() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path())
            .unwrap()
            .with_probe(Arc::new(FixedProbe(1000)));

        // 800 bytes requires 1200 with margin
        let bytes = vec![0u8; 800];
        let err = store.put(&bytes, MediaKind::Audio).await.unwrap_err();
        assert!(err.is_quota());

        // No write attempt happened
        assert_eq!(store.blob_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fits_under_probe() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path())
            .unwrap()
            .with_probe(Arc::new(FixedProbe(1000)));

        let bytes = vec![0u8; 600]; // 900 with margin
        assert!(store.put(&bytes, MediaKind::Photo).await.is_ok());
    }

    #[tokio::test]
    async fn test_total_size_and_count() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path()).unwrap();

        store.put(&[1u8; 10], MediaKind::Photo).await.unwrap();
        store.put(&[2u8; 30], MediaKind::Audio).await.unwrap();

        assert_eq!(store.total_size().unwrap(), 40);
        assert_eq!(store.blob_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_respects_retention() {
        let dir = tempdir().unwrap();
        let store = MediaStore::new(dir.path()).unwrap();

        // An old blob, id stamped 8 days in the past
        let old_millis = Utc::now().timestamp_millis() - 8 * 24 * 60 * 60 * 1000;
        let old_id = format!("photo_{}_deadbeef", old_millis);
        std::fs::write(dir.path().join(&old_id), b"stale").unwrap();

        let fresh = store.put(b"fresh", MediaKind::Photo).await.unwrap();

        let removed = store
            .purge_older_than(Duration::from_secs(7 * 24 * 60 * 60))
            .unwrap();
        assert_eq!(removed, 1);
        assert!(!store.contains(&BlobId::from(old_id.as_str())));
        assert!(store.contains(&fresh));
    }

    #[test]
    fn test_required_space_margin() {
        assert_eq!(required_space(800), 1200);
        assert_eq!(required_space(0), 0);
    }

    #[test]
    fn test_remote_media_path_shape() {
        let path = remote_media_path("acme", "field-7", "plot-3", MediaKind::Photo);
        assert!(path.starts_with("media/acme/field-7/plot-3/"));
        assert!(path.ends_with("_photo.jpg"));
    }
}
