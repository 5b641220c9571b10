//! Property-based tests for fieldsync
//!
//! Invariants that must hold for all inputs:
//! - Blob ids parse back to what was encoded, and parsing never panics
//! - Drain ordering is a total, deterministic order
//! - Offline-field stripping is idempotent and total
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

// ============================================================================
// BLOB ID TESTS
// ============================================================================

mod blob_id_tests {
    use super::*;
    use fieldsync::types::{BlobId, MediaKind};

    proptest! {
        /// Parsing accessors never panic on any string input
        #[test]
        fn never_panics(s in ".*") {
            let id = BlobId::from(s.as_str());
            let _ = id.kind();
            let _ = id.created_at_millis();
        }

        /// A well-formed id round-trips its kind and timestamp
        #[test]
        fn roundtrip(kind_is_photo: bool, millis in 0i64..4_102_444_800_000, suffix in "[a-z0-9]{8}") {
            let kind = if kind_is_photo { MediaKind::Photo } else { MediaKind::Audio };
            let id = BlobId::from(format!("{}_{}_{}", kind.as_str(), millis, suffix).as_str());
            prop_assert_eq!(id.kind(), Some(kind));
            prop_assert_eq!(id.created_at_millis(), Some(millis));
        }

        /// Generated ids are well-formed
        #[test]
        fn generated_ids_parse(kind_is_photo: bool) {
            let kind = if kind_is_photo { MediaKind::Photo } else { MediaKind::Audio };
            let id = BlobId::generate(kind);
            prop_assert_eq!(id.kind(), Some(kind));
            prop_assert!(id.created_at_millis().is_some());
        }
    }
}

// ============================================================================
// DRAIN ORDERING TESTS
// ============================================================================

mod ordering_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldsync::types::{
        sort_for_drain, DocumentPatch, DocumentRef, MediaRefs, ObservationDraft, Operation,
        OperationId, OperationKind, PriorityBucket,
    };
    use serde_json::Map;

    fn operation(selector: u8, secs: i64, n: usize) -> Operation {
        let kind = match selector % 3 {
            0 => OperationKind::CreateObservation(ObservationDraft {
                owner_id: "o".to_string(),
                field_id: "f".to_string(),
                plot_id: "p".to_string(),
                observed_at: Utc::now(),
                category: "pest".to_string(),
                notes: None,
                extra: Map::new(),
            }),
            1 => OperationKind::UpdateObservation(DocumentPatch {
                document_id: "d".to_string(),
                changes: Map::from_iter([("k".to_string(), serde_json::json!(1))]),
            }),
            _ => OperationKind::DeleteObservation(DocumentRef {
                document_id: "d".to_string(),
            }),
        };
        Operation {
            id: OperationId::from(format!("op-{}", n).as_str()),
            kind,
            media: MediaRefs::default(),
            enqueued_at: Utc.timestamp_opt(secs, 0).unwrap(),
            retry_count: 0,
        }
    }

    proptest! {
        /// Sorted output is monotone: buckets never decrease, and within a
        /// bucket timestamps never decrease
        #[test]
        fn sorted_output_is_monotone(entries in prop::collection::vec((0u8..3, 0i64..1_000_000), 0..40)) {
            let mut ops: Vec<Operation> = entries
                .iter()
                .enumerate()
                .map(|(n, (selector, secs))| operation(*selector, *secs, n))
                .collect();
            sort_for_drain(&mut ops);

            for pair in ops.windows(2) {
                let (a, b) = (&pair[0], &pair[1]);
                prop_assert!(a.kind.bucket() <= b.kind.bucket());
                if a.kind.bucket() == b.kind.bucket() {
                    prop_assert!(a.enqueued_at <= b.enqueued_at);
                }
            }
        }

        /// Sorting preserves the multiset of operations
        #[test]
        fn sorting_loses_nothing(entries in prop::collection::vec((0u8..3, 0i64..1_000_000), 0..40)) {
            let ops: Vec<Operation> = entries
                .iter()
                .enumerate()
                .map(|(n, (selector, secs))| operation(*selector, *secs, n))
                .collect();
            let mut sorted = ops.clone();
            sort_for_drain(&mut sorted);

            prop_assert_eq!(sorted.len(), ops.len());
            let mut ids: Vec<String> = ops.iter().map(|o| o.id.to_string()).collect();
            let mut sorted_ids: Vec<String> = sorted.iter().map(|o| o.id.to_string()).collect();
            ids.sort();
            sorted_ids.sort();
            prop_assert_eq!(ids, sorted_ids);
        }

        /// Creates always drain before updates, updates before deletes
        #[test]
        fn buckets_are_strictly_layered(entries in prop::collection::vec((0u8..3, 0i64..1_000_000), 1..40)) {
            let mut ops: Vec<Operation> = entries
                .iter()
                .enumerate()
                .map(|(n, (selector, secs))| operation(*selector, *secs, n))
                .collect();
            sort_for_drain(&mut ops);

            let mut seen_update = false;
            let mut seen_delete = false;
            for op in &ops {
                match op.kind.bucket() {
                    PriorityBucket::Create => prop_assert!(!seen_update && !seen_delete),
                    PriorityBucket::Update => {
                        prop_assert!(!seen_delete);
                        seen_update = true;
                    }
                    PriorityBucket::Delete => seen_delete = true,
                }
            }
        }
    }
}

// ============================================================================
// OFFLINE FIELD STRIPPING TESTS
// ============================================================================

mod strip_tests {
    use super::*;
    use fieldsync::sync::strip_offline_fields;
    use serde_json::{Map, Value};

    fn object(keys: Vec<(String, i64)>) -> Value {
        let mut map = Map::new();
        for (key, value) in keys {
            map.insert(key, Value::from(value));
        }
        Value::Object(map)
    }

    proptest! {
        /// After stripping, no underscore-prefixed key remains
        #[test]
        fn no_internal_keys_survive(keys in prop::collection::vec(("[_a-z][a-z0-9_]{0,12}", any::<i64>()), 0..16)) {
            let mut doc = object(keys.into_iter().map(|(k, v)| (k, v)).collect());
            strip_offline_fields(&mut doc);
            if let Value::Object(map) = &doc {
                prop_assert!(map.keys().all(|k| !k.starts_with('_')));
            }
        }

        /// Public keys are preserved with their values
        #[test]
        fn public_keys_preserved(keys in prop::collection::vec(("[a-z][a-z0-9_]{0,12}", any::<i64>()), 0..16)) {
            let expected = object(keys.clone());
            let mut doc = object(keys);
            strip_offline_fields(&mut doc);
            prop_assert_eq!(doc, expected);
        }

        /// Stripping is idempotent
        #[test]
        fn idempotent(keys in prop::collection::vec(("[_a-z][a-z0-9_]{0,12}", any::<i64>()), 0..16)) {
            let mut once = object(keys);
            strip_offline_fields(&mut once);
            let mut twice = once.clone();
            strip_offline_fields(&mut twice);
            prop_assert_eq!(once, twice);
        }
    }
}

// ============================================================================
// MEDIA SPACE MARGIN TESTS
// ============================================================================

mod space_tests {
    use super::*;
    use fieldsync::media::required_space;

    proptest! {
        /// The margin is exactly half the payload again, and never shrinks
        #[test]
        fn margin_is_half_again(len in 0usize..100_000_000) {
            let required = required_space(len);
            prop_assert_eq!(required, len as u64 + (len as u64) / 2);
            prop_assert!(required >= len as u64);
        }
    }
}

// ============================================================================
// OPERATION SERDE TESTS
// ============================================================================

mod serde_tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fieldsync::types::{
        DocumentRef, MediaRefs, Operation, OperationId, OperationKind, SummaryFeedback,
    };

    proptest! {
        /// The envelope round-trips through its durable JSON form
        #[test]
        fn operation_roundtrips(
            doc_id in "[a-zA-Z0-9-]{1,24}",
            feedback in "\\PC{0,64}",
            secs in 0i64..4_000_000_000,
            retries in 0u32..10,
            use_feedback: bool,
        ) {
            let kind = if use_feedback {
                OperationKind::UpdateSummaryFeedback(SummaryFeedback {
                    document_id: doc_id.clone(),
                    feedback,
                })
            } else {
                OperationKind::DeleteRouteSummary(DocumentRef { document_id: doc_id })
            };
            let op = Operation {
                id: OperationId::generate(),
                kind,
                media: MediaRefs::default(),
                enqueued_at: Utc.timestamp_opt(secs, 0).unwrap(),
                retry_count: retries,
            };
            let json = serde_json::to_string(&op).unwrap();
            let back: Operation = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(back, op);
        }
    }
}
