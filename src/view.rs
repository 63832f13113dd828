// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-only access to the published snapshot.
//!
//! Every read borrows the watch channel just long enough to clone an `Arc`,
//! so readers never block on I/O or on a refresh in progress, and a reader
//! always sees one complete snapshot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

use crate::coordinator::Published;
use crate::pattern::Pattern;
use crate::snapshot::Snapshot;

/// Statistics describing the published snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub pattern_count: usize,
    pub age_seconds: i64,
    pub is_expired: bool,
    pub ttl_seconds: u64,
    pub products: Vec<String>,
    pub categories: Vec<String>,
    pub last_updated: DateTime<Utc>,
    pub source: &'static str,
    pub degraded: bool,
}

/// Consumer handle, obtained from [`SyncOrchestrator::view`](crate::SyncOrchestrator::view).
#[derive(Debug, Clone)]
pub struct ConsumerView {
    rx: watch::Receiver<Arc<Published>>,
}

impl ConsumerView {
    pub(crate) fn new(rx: watch::Receiver<Arc<Published>>) -> Self {
        Self { rx }
    }

    /// The current snapshot. Holding it pins that version; later publishes
    /// don't affect it.
    #[must_use]
    pub fn get_patterns(&self) -> Arc<Snapshot> {
        Arc::clone(&self.rx.borrow().snapshot)
    }

    #[must_use]
    pub fn get_patterns_by_product(&self, product: &str) -> Vec<Arc<Pattern>> {
        self.get_patterns().by_product(product)
    }

    #[must_use]
    pub fn get_patterns_by_category(&self, category: &str) -> Vec<Arc<Pattern>> {
        self.get_patterns().by_category(category)
    }

    #[must_use]
    pub fn pattern(&self, id: &str) -> Option<Arc<Pattern>> {
        self.get_patterns().get(id).cloned()
    }

    #[must_use]
    pub fn has_patterns(&self) -> bool {
        !self.rx.borrow().snapshot.is_empty()
    }

    /// Snapshot together with where it came from.
    #[must_use]
    pub fn published(&self) -> Arc<Published> {
        Arc::clone(&self.rx.borrow())
    }

    #[must_use]
    pub fn get_cache_stats(&self) -> CacheStats {
        let published = self.published();
        let snapshot = &published.snapshot;
        let metadata = snapshot.metadata();
        let now = Utc::now();
        CacheStats {
            pattern_count: snapshot.len(),
            age_seconds: snapshot.age_seconds(now),
            is_expired: snapshot.is_expired_at(now),
            ttl_seconds: metadata.ttl_seconds,
            products: metadata.products.clone(),
            categories: metadata.categories.clone(),
            last_updated: metadata.last_updated,
            source: published.source.as_str(),
            degraded: published.degraded,
        }
    }

    /// Wait for the next publish. Returns `false` once the orchestrator is gone.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }

    /// Whether a publish happened since this view last looked.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        self.rx.has_changed().unwrap_or(false)
    }
}
