//! Property-based tests (fuzzing) for pattern sync resilience.
//!
//! Uses proptest to generate random/malformed inputs and verify the cache
//! loader and the converter never panic, only return clean errors.
//!
//! Run with: `cargo test --test proptest_fuzz`

use chrono::{Duration, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;

use pattern_sync::source::{ExternalReferences, RawParameter, VersionInfo};
use pattern_sync::{
    CacheError, CacheStore, Pattern, PatternConverter, RawRecord, Severity, Snapshot, SyncMode,
};

// =============================================================================
// Strategies for generating test data
// =============================================================================

/// Expressions: mostly valid, some broken, some arbitrary text
fn expression_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-z ]{1,20}",
        r"[a-z]{1,8} \(\?P<[a-z]{1,6}>\\d\+\)",
        Just(r"(unclosed".to_string()),
        Just(r"(?P<dup>a)(?P<dup>b)".to_string()),
        Just(r"[z-a]".to_string()),
        ".{0,40}",
    ]
}

fn raw_record_strategy() -> impl Strategy<Value = RawRecord> {
    (
        (
            ".{0,12}",
            ".{0,8}",
            prop::collection::vec(".{0,8}", 0..3),
            prop_oneof![
                Just("error".to_string()),
                Just("WARN".to_string()),
                Just(" notice ".to_string()),
                Just("debug".to_string()),
                ".{0,10}",
            ],
            expression_strategy(),
            prop::collection::vec(".{0,8}", 0..3),
        ),
        (
            any::<bool>(),
            any::<bool>(),
            prop::option::of(any::<bool>()),
            ".{0,30}",
            ".{0,30}",
            prop::collection::vec((".{0,6}", ".{0,10}"), 0..3),
            prop::collection::vec("[A-Z]{2}-[0-9]{1,4}", 0..3),
        ),
    )
        .prop_map(
            |(
                (id, product, category, severity, expression, tags),
                (active, content, multiline, template, raw_data, parameters, kb_ids),
            )| RawRecord {
                id,
                product,
                category,
                severity,
                expression,
                tags,
                references: ExternalReferences { kb_ids, bug_ids: vec![] },
                version: VersionInfo { introduced: None, fixed: Some("2.1".to_string()) },
                active,
                template,
                documentation: String::new(),
                multiline,
                content,
                parameters: parameters
                    .into_iter()
                    .map(|(name, expression)| RawParameter { name, expression })
                    .collect(),
                raw_data,
                updated_at: None,
            },
        )
}

/// A valid snapshot of 0..8 patterns
fn snapshot_strategy() -> impl Strategy<Value = Snapshot> {
    (
        prop::collection::btree_map("[a-z0-9-]{1,10}", "[a-z ]{1,16}", 0..8),
        1u64..100_000,
        0i64..1_000_000,
    )
        .prop_map(|(entries, ttl, offset)| {
            let at = Utc.timestamp_opt(1_700_000_000 + offset, 0).unwrap();
            let patterns = entries.into_iter().map(|(id, expr)| {
                Pattern::new(id, &expr)
                    .unwrap()
                    .with_severity(Severity::Warning)
                    .with_product("fuzz")
                    .with_category("generated")
            });
            Snapshot::build(patterns, ttl, at)
        })
}

/// Generate arbitrary JSON values (including invalid structures)
fn arbitrary_json_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(|n| Value::Number(n.into())),
        ".*".prop_map(Value::String),
    ];

    leaf.prop_recursive(
        4,   // depth
        64,  // max nodes
        10,  // items per collection
        |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..10)
                    .prop_map(Value::Array),
                prop::collection::hash_map(".*", inner, 0..10)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        },
    )
}

// =============================================================================
// Cache File Fuzz Tests
// =============================================================================

proptest! {
    /// The cache loader should never panic on arbitrary bytes
    #[test]
    fn fuzz_cache_from_random_bytes(bytes in prop::collection::vec(any::<u8>(), 0..10000)) {
        prop_assert!(CacheStore::decode_bytes(&bytes).is_err());
    }

    /// Arbitrary JSON is rejected cleanly
    #[test]
    fn fuzz_cache_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        let _ = CacheStore::decode_bytes(&serialized);
    }

    /// A corrupted cache file either fails to load or still carries the
    /// original patterns (the corruption hit whitespace or unchecked metadata)
    #[test]
    fn fuzz_corrupted_cache_file(
        snapshot in snapshot_strategy(),
        corruption in prop::collection::vec(1u8..=255, 1..50),
        position in 0usize..10000,
    ) {
        let serialized = CacheStore::encode_bytes(&snapshot).unwrap();
        let mut corrupted = serialized.clone();
        let pos = position % corrupted.len();
        for (i, b) in corruption.iter().enumerate() {
            let idx = (pos + i) % corrupted.len();
            corrupted[idx] ^= b;
        }

        match CacheStore::decode_bytes(&corrupted) {
            Ok(loaded) => prop_assert_eq!(loaded.to_documents(), snapshot.to_documents()),
            Err(e) => prop_assert!(matches!(
                e,
                CacheError::Corrupt { .. } | CacheError::ChecksumMismatch { .. }
            ), "unexpected error variant: {:?}", e),
        }
    }

    /// Truncating a cache file at any point is detected
    #[test]
    fn fuzz_truncated_cache_file(snapshot in snapshot_strategy(), cut in 0usize..10000) {
        let serialized = CacheStore::encode_bytes(&snapshot).unwrap();
        let cut = cut % serialized.len();
        let result = CacheStore::decode_bytes(&serialized[..cut]);
        prop_assert!(matches!(result, Err(CacheError::Corrupt { .. })), "unexpected result: {:?}", result);
    }

    /// Encoding then decoding a snapshot yields the same snapshot
    #[test]
    fn prop_cache_roundtrip(snapshot in snapshot_strategy()) {
        let bytes = CacheStore::encode_bytes(&snapshot).unwrap();
        prop_assert_eq!(CacheStore::decode_bytes(&bytes).unwrap(), snapshot);
    }
}

// =============================================================================
// Converter Fuzz Tests
// =============================================================================

proptest! {
    /// Arbitrary records never panic the converter, and every record is
    /// accounted for exactly once
    #[test]
    fn fuzz_convert_batch_accounts_for_every_record(
        records in prop::collection::vec(raw_record_strategy(), 0..30)
    ) {
        let result = PatternConverter::default().convert_batch(&records);
        prop_assert_eq!(result.total, records.len());
        prop_assert_eq!(result.patterns.len() + result.errors.len(), records.len());
        prop_assert!(result.success_rate() >= 0.0 && result.success_rate() <= 1.0);

        for pattern in &result.patterns {
            prop_assert!(!pattern.id.is_empty());
            prop_assert!(!pattern.tags.iter().any(|t| t.is_empty()));
            if !pattern.product.is_empty() {
                prop_assert!(pattern.tags.contains(&pattern.product));
            }
        }
    }

    /// Raw record JSON of any shape deserializes or fails cleanly
    #[test]
    fn fuzz_raw_record_from_arbitrary_json(json in arbitrary_json_strategy()) {
        let serialized = serde_json::to_vec(&json).unwrap();
        if let Ok(record) = serde_json::from_slice::<RawRecord>(&serialized) {
            let _ = PatternConverter::default().convert(&record);
        }
    }

    /// Severity mapping is total and case-insensitive
    #[test]
    fn prop_severity_mapping_total(raw in ".{0,20}") {
        let converter = PatternConverter::default();
        let severity = converter.map_severity(&raw);
        prop_assert_eq!(converter.map_severity(&raw.to_ascii_uppercase()), severity);
    }

    /// Converted snapshots survive the cache format
    #[test]
    fn prop_converted_snapshot_roundtrips(
        records in prop::collection::vec(raw_record_strategy(), 0..20)
    ) {
        let result = PatternConverter::default().convert_batch(&records);
        let snapshot = Snapshot::build(result.patterns, 3600, Utc::now());
        let bytes = CacheStore::encode_bytes(&snapshot).unwrap();
        prop_assert_eq!(CacheStore::decode_bytes(&bytes).unwrap(), snapshot);
    }
}

// =============================================================================
// Snapshot and Config Invariants
// =============================================================================

proptest! {
    /// Duplicate ids collapse; metadata always agrees with the content
    #[test]
    fn prop_snapshot_ids_unique(ids in prop::collection::vec("[a-d]{1,2}", 0..40)) {
        let patterns = ids.iter().map(|id| Pattern::new(id.as_str(), "x").unwrap());
        let snapshot = Snapshot::build(patterns, 60, Utc::now());
        let distinct: std::collections::BTreeSet<_> = ids.iter().collect();
        prop_assert_eq!(snapshot.len(), distinct.len());
        prop_assert_eq!(snapshot.metadata().pattern_count, snapshot.len());
    }

    /// Exactly one second either side of the TTL decides expiry
    #[test]
    fn prop_ttl_boundary(ttl in 1u64..10_000_000) {
        let updated = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let snapshot = Snapshot::build([Pattern::new("p", "x").unwrap()], ttl, updated);
        let ttl = i64::try_from(ttl).unwrap();
        prop_assert!(!snapshot.is_expired_at(updated + Duration::seconds(ttl - 1)));
        prop_assert!(!snapshot.is_expired_at(updated + Duration::seconds(ttl)));
        prop_assert!(snapshot.is_expired_at(updated + Duration::seconds(ttl + 1)));
    }

    /// Mode strings parse regardless of case and padding; others are rejected
    #[test]
    fn prop_mode_parsing(
        index in 0usize..4,
        upper in prop::collection::vec(any::<bool>(), 16),
        pad in " {0,3}",
        junk in "[a-z]{1,12}",
    ) {
        let modes = [SyncMode::OfflineOnly, SyncMode::OnlineFirst, SyncMode::CacheFirst, SyncMode::AlwaysOnline];
        let mode = modes[index];
        let mixed: String = mode
            .as_str()
            .chars()
            .zip(upper.iter().cycle())
            .map(|(c, up)| if *up { c.to_ascii_uppercase() } else { c })
            .collect();
        prop_assert_eq!(format!("{pad}{mixed}{pad}").parse::<SyncMode>().unwrap(), mode);

        if !modes.iter().any(|m| m.as_str() == junk) {
            prop_assert!(junk.parse::<SyncMode>().is_err());
        }
    }
}
