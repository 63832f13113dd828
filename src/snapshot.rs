// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Immutable, versioned pattern sets.
//!
//! A [`Snapshot`] is always built whole and never mutated afterwards. The
//! metadata is derived from the pattern map at build time, so
//! `pattern_count`, `products`, `categories` and `checksum` agree with the
//! content by construction.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::pattern::{Pattern, PatternDocument};

/// On-disk schema version written into every snapshot.
pub const SCHEMA_VERSION: &str = "1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub pattern_count: usize,
    pub ttl_seconds: u64,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
    /// SHA-256 over the pattern content, hex encoded
    #[serde(default)]
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    metadata: SnapshotMetadata,
    patterns: BTreeMap<String, Arc<Pattern>>,
}

impl Snapshot {
    /// Build a snapshot stamped `now`.
    ///
    /// Duplicate ids collapse to the last occurrence.
    pub fn build(patterns: impl IntoIterator<Item = Pattern>, ttl_seconds: u64, now: DateTime<Utc>) -> Self {
        Self::build_at(patterns, ttl_seconds, now, now)
    }

    /// Build a snapshot with explicit timestamps.
    pub fn build_at(
        patterns: impl IntoIterator<Item = Pattern>,
        ttl_seconds: u64,
        created_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let mut map: BTreeMap<String, Arc<Pattern>> = BTreeMap::new();
        for pattern in patterns {
            let id = pattern.id.clone();
            if let Some(previous) = map.insert(id.clone(), Arc::new(pattern)) {
                warn!(
                    id = %id,
                    replaced_expression = %previous.expression(),
                    "Duplicate pattern id, keeping the later definition"
                );
            }
        }
        Self::from_map(map, ttl_seconds, created_at, last_updated)
    }

    /// An empty snapshot, used before the first resolution.
    pub fn empty(ttl_seconds: u64) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self::from_map(BTreeMap::new(), ttl_seconds, epoch, epoch)
    }

    fn from_map(
        patterns: BTreeMap<String, Arc<Pattern>>,
        ttl_seconds: u64,
        created_at: DateTime<Utc>,
        last_updated: DateTime<Utc>,
    ) -> Self {
        let products: BTreeSet<String> = patterns
            .values()
            .map(|p| p.product.clone())
            .filter(|p| !p.is_empty())
            .collect();
        let categories: BTreeSet<String> = patterns
            .values()
            .flat_map(|p| p.categories.iter().cloned())
            .filter(|c| !c.is_empty())
            .collect();
        let checksum = content_checksum(patterns.values().map(|p| p.to_document()));

        let metadata = SnapshotMetadata {
            version: SCHEMA_VERSION.to_string(),
            created_at,
            last_updated,
            pattern_count: patterns.len(),
            ttl_seconds,
            products: products.into_iter().collect(),
            categories: categories.into_iter().collect(),
            checksum,
        };

        Self { metadata, patterns }
    }

    /// Reassemble a snapshot read back from storage. The caller has verified
    /// count and checksum against `metadata`.
    pub(crate) fn from_verified_parts(
        metadata: SnapshotMetadata,
        patterns: BTreeMap<String, Arc<Pattern>>,
    ) -> Self {
        Self { metadata, patterns }
    }

    #[must_use]
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    #[must_use]
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.metadata.last_updated
    }

    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.metadata.ttl_seconds
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Arc<Pattern>> {
        self.patterns.get(id)
    }

    /// Patterns in id order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Pattern>> {
        self.patterns.values()
    }

    #[must_use]
    pub fn ids(&self) -> Vec<&str> {
        self.patterns.keys().map(String::as_str).collect()
    }

    #[must_use]
    pub fn by_product(&self, product: &str) -> Vec<Arc<Pattern>> {
        self.patterns
            .values()
            .filter(|p| p.product == product)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn by_category(&self, category: &str) -> Vec<Arc<Pattern>> {
        self.patterns
            .values()
            .filter(|p| p.has_category(category))
            .cloned()
            .collect()
    }

    /// Seconds since `last_updated` (negative if the clock went backwards).
    #[must_use]
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.metadata.last_updated).num_seconds()
    }

    /// `now - last_updated > ttl`. Exactly `ttl` seconds old is still valid.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        let ttl = i64::try_from(self.metadata.ttl_seconds).unwrap_or(i64::MAX);
        self.age_seconds(now) > ttl
    }

    /// Serialized form of every pattern, keyed by id.
    #[must_use]
    pub fn to_documents(&self) -> BTreeMap<String, PatternDocument> {
        self.patterns
            .iter()
            .map(|(id, p)| (id.clone(), p.to_document()))
            .collect()
    }
}

/// Checksum over pattern documents in id order.
pub(crate) fn content_checksum(documents: impl Iterator<Item = PatternDocument>) -> String {
    let mut hasher = Sha256::new();
    for doc in documents {
        doc.digest_into(&mut hasher);
    }
    hex::encode(hasher.finalize())
}
