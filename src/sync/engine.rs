//! Drain engine
//!
//! Processes every queued operation against the remote stores: resolves
//! staged media to uploaded URLs, strips offline-only fields, submits the
//! mutation, and settles the queue, feedback cache, and media store on the
//! outcome. Exactly one drain pass runs at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::time::{sleep, timeout, Instant};

use super::conflict::{check_for_conflict, ConflictLog, ConflictRecord, ResolutionStrategy};
use crate::error::{Result, SyncError};
use crate::feedback::FeedbackCache;
use crate::media::{remote_media_path, MediaStore};
use crate::queue::OperationQueue;
use crate::remote::{DocumentStore, ObjectStore};
use crate::status::StatusBoard;
use crate::types::{
    sort_for_drain, DrainOutcome, DrainReason, DrainReport, MediaKind, Operation, OperationId,
    OperationKind, PermanentFailure, PriorityBucket, SyncConfig,
};

/// Remove offline-only fields from an outgoing document. Internal markers
/// (the pending-operation tag, local media markers) all live under a
/// leading underscore and must never reach the remote store.
pub fn strip_offline_fields(document: &mut Value) {
    if let Value::Object(map) = document {
        map.retain(|key, _| !key.starts_with('_'));
    }
}

/// The sync orchestrator
pub struct SyncEngine {
    queue: Arc<OperationQueue>,
    media: Arc<MediaStore>,
    feedback: Arc<FeedbackCache>,
    conflicts: Arc<ConflictLog>,
    status: Arc<StatusBoard>,
    documents: Arc<dyn DocumentStore>,
    objects: Arc<dyn ObjectStore>,
    config: SyncConfig,
    draining: AtomicBool,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<OperationQueue>,
        media: Arc<MediaStore>,
        feedback: Arc<FeedbackCache>,
        conflicts: Arc<ConflictLog>,
        status: Arc<StatusBoard>,
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            queue,
            media,
            feedback,
            conflicts,
            status,
            documents,
            objects,
            config,
            draining: AtomicBool::new(false),
        }
    }

    pub fn queue(&self) -> &OperationQueue {
        &self.queue
    }

    pub fn media(&self) -> &MediaStore {
        &self.media
    }

    pub fn feedback(&self) -> &FeedbackCache {
        &self.feedback
    }

    pub fn conflicts(&self) -> &ConflictLog {
        &self.conflicts
    }

    pub fn status(&self) -> &StatusBoard {
        &self.status
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Stage a mutation that could not complete synchronously: copy any
    /// captured media into the blob store, enqueue the operation, and
    /// mirror the intended document for instant display.
    ///
    /// Validation and quota errors surface here, before anything is queued,
    /// so the caller can warn the operator while the capture is still in
    /// hand.
    pub async fn stage(
        &self,
        kind: OperationKind,
        photo: Option<Vec<u8>>,
        audio: Option<Vec<u8>>,
    ) -> Result<OperationId> {
        kind.validate()?;

        let mut media = crate::types::MediaRefs::default();
        if let Some(bytes) = photo {
            media.photo = Some(self.media.put(&bytes, MediaKind::Photo).await?);
        }
        if let Some(bytes) = audio {
            media.audio = Some(self.media.put(&bytes, MediaKind::Audio).await?);
        }

        let collection = kind.collection();
        let document = kind.outgoing_document()?;
        let id = self.queue.enqueue(kind, media)?;
        if document.is_object() {
            self.feedback.add(collection, &id, document);
        }
        Ok(id)
    }

    /// Run one drain pass. A trigger while a pass is active is a no-op.
    pub async fn drain(&self, reason: DrainReason) -> Result<DrainOutcome> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(%reason, "drain already in progress, trigger ignored");
            return Ok(DrainOutcome::AlreadyRunning);
        }

        self.status.set_syncing(true);
        let started = Instant::now();
        let result = self.drain_pass(reason).await;

        match &result {
            Ok(_) => self.status.drain_finished(Utc::now()),
            Err(_) => self.status.set_syncing(false),
        }
        self.draining.store(false, Ordering::SeqCst);

        match result {
            Ok(mut report) => {
                report.duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    %reason,
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    dropped = report.dropped.len(),
                    "drain pass completed in {} ms",
                    report.duration_ms
                );
                Ok(DrainOutcome::Completed(report))
            }
            Err(e) => {
                tracing::error!(%reason, "drain pass aborted: {}", e);
                Err(e)
            }
        }
    }

    async fn drain_pass(&self, reason: DrainReason) -> Result<DrainReport> {
        let mut ops = self.queue.list_valid()?;
        sort_for_drain(&mut ops);
        tracing::debug!(%reason, pending = ops.len(), "drain pass starting");

        let mut report = DrainReport {
            attempted: ops.len(),
            ..DrainReport::default()
        };

        let last = ops.len().saturating_sub(1);
        for (index, op) in ops.iter().enumerate() {
            self.process(op, &mut report).await;
            // Pace submissions so a long queue does not burst the remote
            if index < last {
                sleep(self.config.pacing).await;
            }
        }

        Ok(report)
    }

    async fn process(&self, op: &Operation, report: &mut DrainReport) {
        let started = Instant::now();
        match self.submit(op, report).await {
            Ok(()) => {
                self.queue.dequeue(&op.id);
                self.feedback.remove(op.kind.collection(), &op.id);
                self.settle_media(op).await;
                report.succeeded += 1;
                tracing::debug!(operation = %op.id, kind = op.kind.tag(), "operation confirmed");
            }
            Err(e) => {
                report.failed += 1;
                self.queue.increment_retry(&op.id);
                let retries = op.retry_count + 1;
                if retries >= self.config.retry_ceiling {
                    self.queue.dequeue(&op.id);
                    self.feedback.remove(op.kind.collection(), &op.id);
                    tracing::error!(
                        operation = %op.id,
                        kind = op.kind.tag(),
                        retries,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "operation dropped after exhausting retries: {}",
                        e
                    );
                    report.dropped.push(PermanentFailure {
                        operation_id: op.id.clone(),
                        kind_tag: op.kind.tag().to_string(),
                        retry_count: retries,
                        error: e.to_string(),
                    });
                } else {
                    tracing::warn!(
                        operation = %op.id,
                        kind = op.kind.tag(),
                        retries,
                        "operation failed, left queued: {}",
                        e
                    );
                }
            }
        }
    }

    /// Steps (a)-(c) for one operation: resolve media, strip internal
    /// fields, submit to the remote store.
    async fn submit(&self, op: &Operation, report: &mut DrainReport) -> Result<()> {
        let mut document = op.kind.outgoing_document()?;

        for (media_kind, blob_id) in op.media.iter() {
            match self.media.get(blob_id).await {
                Ok(Some(bytes)) => {
                    let (owner, field, plot) = op.kind.media_scope();
                    let path = remote_media_path(owner, field, plot, media_kind);
                    let url = timeout(
                        self.config.remote_timeout,
                        self.objects.upload(&path, bytes, media_kind.content_type()),
                    )
                    .await
                    .map_err(|_| SyncError::Timeout(format!("media upload for {}", blob_id)))??;
                    if let Value::Object(map) = &mut document {
                        map.insert(media_kind.url_field().to_string(), Value::String(url));
                    }
                }
                Ok(None) => {
                    tracing::warn!(
                        operation = %op.id,
                        blob = %blob_id,
                        "referenced blob missing, submitting without it"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        operation = %op.id,
                        blob = %blob_id,
                        "blob unreadable, submitting without it: {}",
                        e
                    );
                }
            }
        }

        strip_offline_fields(&mut document);

        if op.kind.bucket() == PriorityBucket::Update {
            self.observe_conflict(op, report).await;
        }

        let collection = op.kind.collection();
        let call = async {
            match op.kind.bucket() {
                PriorityBucket::Create => {
                    let remote_id = self.documents.create(collection, document).await?;
                    tracing::debug!(operation = %op.id, remote_id = %remote_id, "document created");
                    Ok(())
                }
                PriorityBucket::Update => {
                    let document_id = op.kind.document_id().unwrap_or_default();
                    self.documents.update(collection, document_id, document).await
                }
                PriorityBucket::Delete => {
                    let document_id = op.kind.document_id().unwrap_or_default();
                    self.documents.delete(collection, document_id).await
                }
            }
        };

        timeout(self.config.remote_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout(format!("submit {}", op.kind.tag())))?
    }

    /// Probe for divergence before an update-kind submission. Purely
    /// observational: a detected conflict is logged and counted, then the
    /// submission proceeds under the local-wins strategy.
    async fn observe_conflict(&self, op: &Operation, report: &mut DrainReport) {
        let Some(document_id) = op.kind.document_id() else {
            return;
        };
        let check = check_for_conflict(
            self.documents.as_ref(),
            op.kind.collection(),
            document_id,
            op.enqueued_at,
        )
        .await;
        if check.has_conflict {
            report.conflicts_detected += 1;
            self.conflicts.record(ConflictRecord {
                operation_id: op.id.clone(),
                kind_tag: op.kind.tag().to_string(),
                document_id: document_id.to_string(),
                local_timestamp: op.enqueued_at,
                remote_timestamp: check.remote_timestamp,
                reason: "remote document modified after local capture".to_string(),
                detected_at: Utc::now(),
            });
            match ResolutionStrategy::current() {
                ResolutionStrategy::LocalWins => {}
            }
        }
    }

    /// Step (d) cleanup: release uploaded blobs. Kinds with a grace window
    /// are released by a deferred task so the drain loop never waits on an
    /// unrelated cleanup timer.
    async fn settle_media(&self, op: &Operation) {
        for (media_kind, blob_id) in op.media.iter() {
            if media_kind.has_grace_window() {
                let media = Arc::clone(&self.media);
                let blob_id = blob_id.clone();
                let grace = self.config.blob_grace;
                tokio::spawn(async move {
                    sleep(grace).await;
                    if let Err(e) = media.delete(&blob_id).await {
                        tracing::warn!(blob = %blob_id, "deferred blob cleanup failed: {}", e);
                    }
                });
            } else if let Err(e) = self.media.delete(blob_id).await {
                tracing::warn!(blob = %blob_id, "blob cleanup failed: {}", e);
            }
        }
    }
}
