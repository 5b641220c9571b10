//! Core types for fieldsync
//!
//! The operation envelope, the closed set of mutation kinds, media
//! identifiers, and the engine configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, SyncError};

/// Collection name for observation records
pub const OBSERVATIONS: &str = "observations";
/// Collection name for route summaries
pub const ROUTE_SUMMARIES: &str = "route_summaries";
/// Collection name for treatment prescriptions
pub const PRESCRIPTIONS: &str = "prescriptions";

/// Unique identifier of a queued operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(String);

impl OperationId {
    /// Generate a fresh globally unique id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of a captured media blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Audio => "audio",
        }
    }

    /// MIME type used when uploading to the remote object store
    pub fn content_type(&self) -> &'static str {
        match self {
            MediaKind::Photo => "image/jpeg",
            MediaKind::Audio => "audio/webm",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Audio => "webm",
        }
    }

    /// Document field the uploaded retrieval URL is merged under
    pub fn url_field(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo_url",
            MediaKind::Audio => "audio_url",
        }
    }

    /// Whether local bytes are released after a grace window instead of
    /// immediately. Audio playback may still reference the local copy when
    /// the upload confirms.
    pub fn has_grace_window(&self) -> bool {
        matches!(self, MediaKind::Audio)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MediaKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "photo" => Ok(MediaKind::Photo),
            "audio" => Ok(MediaKind::Audio),
            other => Err(format!("Unknown media kind: {}", other)),
        }
    }
}

/// Identifier of a staged media blob.
///
/// Encodes kind, creation time, and a random suffix:
/// `photo_1719412345123_a1b2c3d4`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobId(String);

impl BlobId {
    /// Generate a fresh id for a blob of the given kind
    pub fn generate(kind: MediaKind) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(|c| (c as char).to_ascii_lowercase())
            .collect();
        Self(format!(
            "{}_{}_{}",
            kind.as_str(),
            Utc::now().timestamp_millis(),
            suffix
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Media kind encoded in the id, if well-formed
    pub fn kind(&self) -> Option<MediaKind> {
        self.0.split('_').next().and_then(|p| p.parse().ok())
    }

    /// Creation time encoded in the id, if well-formed
    pub fn created_at_millis(&self) -> Option<i64> {
        self.0.split('_').nth(1).and_then(|p| p.parse().ok())
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BlobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Staged media referenced by a queued operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub photo: Option<BlobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<BlobId>,
}

impl MediaRefs {
    pub fn is_empty(&self) -> bool {
        self.photo.is_none() && self.audio.is_none()
    }

    /// Iterate present references in a fixed order (photo first)
    pub fn iter(&self) -> impl Iterator<Item = (MediaKind, &BlobId)> {
        self.photo
            .iter()
            .map(|b| (MediaKind::Photo, b))
            .chain(self.audio.iter().map(|b| (MediaKind::Audio, b)))
    }
}

// ============================================================================
// Mutation payloads
// ============================================================================

/// A new field observation (inspection) captured on site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObservationDraft {
    pub owner_id: String,
    pub field_id: String,
    pub plot_id: String,
    pub observed_at: DateTime<Utc>,
    /// Inspection category (pest, disease, growth stage, ...)
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Free-form capture data (measurements, counts, coordinates)
    #[serde(default, flatten)]
    pub extra: Map<String, Value>,
}

/// A day's route summary across visited plots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSummaryDraft {
    pub owner_id: String,
    pub field_id: String,
    pub route_date: NaiveDate,
    #[serde(default)]
    pub plots_visited: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// A crop-treatment prescription issued for a plot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrescriptionDraft {
    pub owner_id: String,
    pub field_id: String,
    pub plot_id: String,
    pub product: String,
    pub dose_per_ha: f64,
    pub issued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Partial update of an existing remote document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentPatch {
    pub document_id: String,
    #[serde(default)]
    pub changes: Map<String, Value>,
}

/// Reference to an existing remote document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRef {
    pub document_id: String,
}

/// Reviewer feedback attached to a route summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryFeedback {
    pub document_id: String,
    pub feedback: String,
}

// ============================================================================
// Operation kinds
// ============================================================================

/// Priority bucket for drain ordering. Creates go first because an update or
/// delete may target a document whose creation is itself still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityBucket {
    Create = 0,
    Update = 1,
    Delete = 2,
}

/// The closed set of mutations the queue accepts, each with its own payload.
///
/// Serialized tags match the durable wire names (`createRecord`,
/// `updateSummaryFeedback`, ...), so queues written by earlier builds stay
/// readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum OperationKind {
    #[serde(rename = "createRecord")]
    CreateObservation(ObservationDraft),
    #[serde(rename = "updateRecord")]
    UpdateObservation(DocumentPatch),
    #[serde(rename = "deleteRecord")]
    DeleteObservation(DocumentRef),
    #[serde(rename = "createSummary")]
    CreateRouteSummary(RouteSummaryDraft),
    #[serde(rename = "deleteSummary")]
    DeleteRouteSummary(DocumentRef),
    #[serde(rename = "updateSummaryFeedback")]
    UpdateSummaryFeedback(SummaryFeedback),
    #[serde(rename = "createPrescription")]
    CreatePrescription(PrescriptionDraft),
    #[serde(rename = "updatePrescription")]
    UpdatePrescription(DocumentPatch),
    #[serde(rename = "deletePrescription")]
    DeletePrescription(DocumentRef),
}

impl OperationKind {
    /// Durable wire tag of this kind
    pub fn tag(&self) -> &'static str {
        match self {
            OperationKind::CreateObservation(_) => "createRecord",
            OperationKind::UpdateObservation(_) => "updateRecord",
            OperationKind::DeleteObservation(_) => "deleteRecord",
            OperationKind::CreateRouteSummary(_) => "createSummary",
            OperationKind::DeleteRouteSummary(_) => "deleteSummary",
            OperationKind::UpdateSummaryFeedback(_) => "updateSummaryFeedback",
            OperationKind::CreatePrescription(_) => "createPrescription",
            OperationKind::UpdatePrescription(_) => "updatePrescription",
            OperationKind::DeletePrescription(_) => "deletePrescription",
        }
    }

    /// Remote collection this mutation targets
    pub fn collection(&self) -> &'static str {
        match self {
            OperationKind::CreateObservation(_)
            | OperationKind::UpdateObservation(_)
            | OperationKind::DeleteObservation(_) => OBSERVATIONS,
            OperationKind::CreateRouteSummary(_)
            | OperationKind::DeleteRouteSummary(_)
            | OperationKind::UpdateSummaryFeedback(_) => ROUTE_SUMMARIES,
            OperationKind::CreatePrescription(_)
            | OperationKind::UpdatePrescription(_)
            | OperationKind::DeletePrescription(_) => PRESCRIPTIONS,
        }
    }

    pub fn bucket(&self) -> PriorityBucket {
        match self {
            OperationKind::CreateObservation(_)
            | OperationKind::CreateRouteSummary(_)
            | OperationKind::CreatePrescription(_) => PriorityBucket::Create,
            OperationKind::UpdateObservation(_)
            | OperationKind::UpdateSummaryFeedback(_)
            | OperationKind::UpdatePrescription(_) => PriorityBucket::Update,
            OperationKind::DeleteObservation(_)
            | OperationKind::DeleteRouteSummary(_)
            | OperationKind::DeletePrescription(_) => PriorityBucket::Delete,
        }
    }

    /// Target document id, for kinds that address an existing document
    pub fn document_id(&self) -> Option<&str> {
        match self {
            OperationKind::UpdateObservation(p) | OperationKind::UpdatePrescription(p) => {
                Some(&p.document_id)
            }
            OperationKind::DeleteObservation(r)
            | OperationKind::DeleteRouteSummary(r)
            | OperationKind::DeletePrescription(r) => Some(&r.document_id),
            OperationKind::UpdateSummaryFeedback(f) => Some(&f.document_id),
            _ => None,
        }
    }

    /// Reject payloads that could never be submitted
    pub fn validate(&self) -> Result<()> {
        fn non_empty(value: &str, what: &str) -> Result<()> {
            if value.trim().is_empty() {
                Err(SyncError::Validation(format!("{} must not be empty", what)))
            } else {
                Ok(())
            }
        }

        match self {
            OperationKind::CreateObservation(d) => {
                non_empty(&d.owner_id, "owner_id")?;
                non_empty(&d.field_id, "field_id")?;
                non_empty(&d.plot_id, "plot_id")?;
                non_empty(&d.category, "category")
            }
            OperationKind::CreateRouteSummary(d) => {
                non_empty(&d.owner_id, "owner_id")?;
                non_empty(&d.field_id, "field_id")
            }
            OperationKind::CreatePrescription(d) => {
                non_empty(&d.owner_id, "owner_id")?;
                non_empty(&d.field_id, "field_id")?;
                non_empty(&d.plot_id, "plot_id")?;
                non_empty(&d.product, "product")?;
                if d.dose_per_ha <= 0.0 {
                    return Err(SyncError::Validation(
                        "dose_per_ha must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            OperationKind::UpdateObservation(p) | OperationKind::UpdatePrescription(p) => {
                non_empty(&p.document_id, "document_id")?;
                if p.changes.is_empty() {
                    return Err(SyncError::Validation(
                        "update must carry at least one change".to_string(),
                    ));
                }
                Ok(())
            }
            OperationKind::UpdateSummaryFeedback(f) => non_empty(&f.document_id, "document_id"),
            OperationKind::DeleteObservation(r)
            | OperationKind::DeleteRouteSummary(r)
            | OperationKind::DeletePrescription(r) => non_empty(&r.document_id, "document_id"),
        }
    }

    /// Document (or changes map) submitted to the remote store.
    ///
    /// Deletes address the document by id only and carry no body.
    pub fn outgoing_document(&self) -> Result<Value> {
        match self {
            OperationKind::CreateObservation(d) => Ok(serde_json::to_value(d)?),
            OperationKind::CreateRouteSummary(d) => Ok(serde_json::to_value(d)?),
            OperationKind::CreatePrescription(d) => Ok(serde_json::to_value(d)?),
            OperationKind::UpdateObservation(p) | OperationKind::UpdatePrescription(p) => {
                Ok(Value::Object(p.changes.clone()))
            }
            OperationKind::UpdateSummaryFeedback(f) => {
                let mut changes = Map::new();
                changes.insert("feedback".to_string(), Value::String(f.feedback.clone()));
                Ok(Value::Object(changes))
            }
            OperationKind::DeleteObservation(_)
            | OperationKind::DeleteRouteSummary(_)
            | OperationKind::DeletePrescription(_) => Ok(Value::Null),
        }
    }

    /// Domain hierarchy used to derive deterministic media upload paths.
    ///
    /// Kinds that do not carry the full hierarchy fall back to `unassigned`
    /// segments so a path can always be formed.
    pub fn media_scope(&self) -> (&str, &str, &str) {
        match self {
            OperationKind::CreateObservation(d) => (&d.owner_id, &d.field_id, &d.plot_id),
            OperationKind::CreateRouteSummary(d) => (&d.owner_id, &d.field_id, "unassigned"),
            OperationKind::CreatePrescription(d) => (&d.owner_id, &d.field_id, &d.plot_id),
            _ => ("unassigned", "unassigned", "unassigned"),
        }
    }
}

// ============================================================================
// Operation envelope
// ============================================================================

/// A durable record of a mutation that could not be applied immediately
/// against the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OperationId,
    #[serde(flatten)]
    pub kind: OperationKind,
    #[serde(default, skip_serializing_if = "MediaRefs::is_empty")]
    pub media: MediaRefs,
    pub enqueued_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

impl Operation {
    /// Drain ordering: priority bucket, then original enqueue time ascending
    pub fn drain_order(a: &Operation, b: &Operation) -> std::cmp::Ordering {
        a.kind
            .bucket()
            .cmp(&b.kind.bucket())
            .then(a.enqueued_at.cmp(&b.enqueued_at))
    }
}

/// Sort operations into drain order (stable, deterministic within a pass)
pub fn sort_for_drain(ops: &mut [Operation]) {
    ops.sort_by(Operation::drain_order);
}

// ============================================================================
// Status & drain reporting
// ============================================================================

/// Continuously observable sync state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    pub pending_count: usize,
}

/// Why a drain pass started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    Reconnect,
    Manual,
    Poll,
    Shutdown,
}

impl fmt::Display for DrainReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DrainReason::Reconnect => "reconnect",
            DrainReason::Manual => "manual",
            DrainReason::Poll => "poll",
            DrainReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// An operation dropped after exhausting its retries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermanentFailure {
    pub operation_id: OperationId,
    pub kind_tag: String,
    pub retry_count: u32,
    pub error: String,
}

/// Aggregate result of one drain pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DrainReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub dropped: Vec<PermanentFailure>,
    pub conflicts_detected: usize,
    pub duration_ms: u64,
}

/// Result of asking for a drain
#[derive(Debug, Clone)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Another drain pass is already executing; this trigger was a no-op
    AlreadyRunning,
}

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for the sync engine
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts per operation before it is dropped as permanently failed
    pub retry_ceiling: u32,
    /// Delay inserted between operations within a drain pass
    pub pacing: Duration,
    /// Settle delay after an offline-to-online transition
    pub settle_delay: Duration,
    /// Periodic drain interval while online
    pub poll_interval: Duration,
    /// Grace window before deleting uploaded blobs of grace-window kinds
    pub blob_grace: Duration,
    /// Bound on every remote call, independent of the transport's own timeout
    pub remote_timeout: Duration,
    /// Bound on every local blob write attempt
    pub blob_attempt_timeout: Duration,
    /// Local blob write attempts before giving up
    pub blob_write_attempts: u32,
    /// Base backoff between blob write attempts (doubles each attempt)
    pub blob_backoff_base: Duration,
    /// Snapshot cache expiry
    pub snapshot_ttl: Duration,
    /// Media retention window for `purge_older_than` maintenance
    pub media_retention: Duration,
    /// Records kept per collection in the reduced snapshot fallback
    pub essential_records_per_collection: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_ceiling: 3,
            pacing: Duration::from_millis(100),
            settle_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(60),
            blob_grace: Duration::from_secs(10),
            remote_timeout: Duration::from_secs(10),
            blob_attempt_timeout: Duration::from_secs(3),
            blob_write_attempts: 3,
            blob_backoff_base: Duration::from_millis(500),
            snapshot_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            media_retention: Duration::from_secs(7 * 24 * 60 * 60),
            essential_records_per_collection: 40,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn observation() -> ObservationDraft {
        ObservationDraft {
            owner_id: "acme".to_string(),
            field_id: "field-7".to_string(),
            plot_id: "plot-3".to_string(),
            observed_at: Utc.with_ymd_and_hms(2025, 6, 2, 9, 30, 0).unwrap(),
            category: "pest".to_string(),
            notes: Some("aphids on lower leaves".to_string()),
            extra: Map::new(),
        }
    }

    #[test]
    fn test_kind_tags_match_wire_names() {
        let kind = OperationKind::CreateObservation(observation());
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "createRecord");
        assert_eq!(json["payload"]["owner_id"], "acme");

        let feedback = OperationKind::UpdateSummaryFeedback(SummaryFeedback {
            document_id: "rs-1".to_string(),
            feedback: "looks good".to_string(),
        });
        assert_eq!(
            serde_json::to_value(&feedback).unwrap()["kind"],
            "updateSummaryFeedback"
        );
    }

    #[test]
    fn test_operation_roundtrip() {
        let op = Operation {
            id: OperationId::generate(),
            kind: OperationKind::DeletePrescription(DocumentRef {
                document_id: "rx-9".to_string(),
            }),
            media: MediaRefs::default(),
            enqueued_at: Utc::now(),
            retry_count: 2,
        };
        let json = serde_json::to_string(&op).unwrap();
        let back: Operation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, op);
    }

    #[test]
    fn test_bucket_ordering() {
        assert!(PriorityBucket::Create < PriorityBucket::Update);
        assert!(PriorityBucket::Update < PriorityBucket::Delete);
    }

    #[test]
    fn test_drain_order_bucket_then_timestamp() {
        let t = |secs| Utc.timestamp_opt(secs, 0).unwrap();
        let update = Operation {
            id: "a".into(),
            kind: OperationKind::UpdateObservation(DocumentPatch {
                document_id: "d1".to_string(),
                changes: Map::from_iter([("notes".to_string(), Value::String("x".into()))]),
            }),
            media: MediaRefs::default(),
            enqueued_at: t(75),
            retry_count: 0,
        };
        let delete = Operation {
            id: "b".into(),
            kind: OperationKind::DeleteObservation(DocumentRef {
                document_id: "d2".to_string(),
            }),
            media: MediaRefs::default(),
            enqueued_at: t(50),
            retry_count: 0,
        };
        let create = Operation {
            id: "c".into(),
            kind: OperationKind::CreateObservation(observation()),
            media: MediaRefs::default(),
            enqueued_at: t(100),
            retry_count: 0,
        };

        let mut ops = vec![update.clone(), delete.clone(), create.clone()];
        sort_for_drain(&mut ops);
        assert_eq!(ops[0].id, create.id);
        assert_eq!(ops[1].id, update.id);
        assert_eq!(ops[2].id, delete.id);
    }

    #[test]
    fn test_blob_id_encoding() {
        let id = BlobId::generate(MediaKind::Audio);
        assert_eq!(id.kind(), Some(MediaKind::Audio));
        let millis = id.created_at_millis().unwrap();
        assert!(millis > 0);
        assert!(id.as_str().starts_with("audio_"));
    }

    #[test]
    fn test_validate_rejects_empty_ids() {
        let kind = OperationKind::DeleteObservation(DocumentRef {
            document_id: "  ".to_string(),
        });
        assert!(matches!(
            kind.validate(),
            Err(SyncError::Validation(_))
        ));

        let kind = OperationKind::UpdateObservation(DocumentPatch {
            document_id: "d1".to_string(),
            changes: Map::new(),
        });
        assert!(kind.validate().is_err());
    }

    #[test]
    fn test_outgoing_document_for_feedback_update() {
        let kind = OperationKind::UpdateSummaryFeedback(SummaryFeedback {
            document_id: "rs-1".to_string(),
            feedback: "resample plot 4".to_string(),
        });
        let doc = kind.outgoing_document().unwrap();
        assert_eq!(doc["feedback"], "resample plot 4");
        assert_eq!(kind.collection(), ROUTE_SUMMARIES);
    }

    #[test]
    fn test_media_scope_fallback() {
        let kind = OperationKind::DeleteObservation(DocumentRef {
            document_id: "d1".to_string(),
        });
        assert_eq!(kind.media_scope(), ("unassigned", "unassigned", "unassigned"));
    }
}
