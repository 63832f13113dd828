// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the sync orchestrator.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::cache::CacheError;
use crate::config::{ConfigError, SyncMode};
use crate::snapshot::Snapshot;
use crate::source::NetworkError;

/// Orchestrator lifecycle state.
///
/// Use [`super::SyncOrchestrator::state()`] to check the current state or
/// [`super::SyncOrchestrator::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Constructed, nothing published yet
    Created,
    /// Initial resolution in progress
    Initializing,
    /// A snapshot is published
    Ready,
    /// Published and the background refresh task is running
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Where a resolved snapshot came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolveSource {
    Remote,
    Cache,
    Default,
}

impl ResolveSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Cache => "cache",
            Self::Default => "default",
        }
    }
}

impl std::fmt::Display for ResolveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of walking a fallback chain.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub snapshot: Arc<Snapshot>,
    pub source: ResolveSource,
    /// A stale cache or the built-in defaults was served as a fallback
    pub degraded: bool,
    /// Failures passed over on the way to `source`
    pub warnings: Vec<String>,
    /// Raw records returned by the remote (0 unless `source` is Remote)
    pub records_fetched: usize,
    /// Records the converter rejected or skipped
    pub conversion_errors: usize,
}

/// The snapshot currently served to consumers, with its provenance.
#[derive(Debug, Clone)]
pub struct Published {
    pub snapshot: Arc<Snapshot>,
    pub source: ResolveSource,
    pub degraded: bool,
    pub published_at: DateTime<Utc>,
}

impl Published {
    /// Empty placeholder visible before the first publish.
    pub(crate) fn placeholder(ttl_seconds: u64) -> Self {
        Self {
            snapshot: Arc::new(Snapshot::empty(ttl_seconds)),
            source: ResolveSource::Default,
            degraded: true,
            published_at: DateTime::<Utc>::UNIX_EPOCH,
        }
    }

    /// Whether this candidate should replace `current`.
    ///
    /// Real data always beats the built-in defaults, defaults never replace
    /// real data, otherwise the candidate must be strictly newer and carry
    /// different content.
    #[must_use]
    pub fn supersedes(&self, current: &Published) -> bool {
        match (current.source, self.source) {
            (ResolveSource::Default, s) if s != ResolveSource::Default => true,
            (c, ResolveSource::Default) if c != ResolveSource::Default => false,
            _ if self.snapshot.metadata().checksum == current.snapshot.metadata().checksum => false,
            _ => {
                self.snapshot.last_updated() > current.snapshot.last_updated()
                    || (current.snapshot.is_empty() && !self.snapshot.is_empty())
            }
        }
    }
}

/// Structured result of [`initialize`](super::SyncOrchestrator::initialize)
/// and [`force_refresh`](super::SyncOrchestrator::force_refresh).
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub source: ResolveSource,
    pub degraded: bool,
    pub pattern_count: usize,
    pub records_fetched: usize,
    pub conversion_errors: usize,
    pub elapsed_ms: u64,
    /// Whether the resolved snapshot replaced the published one
    pub published: bool,
    pub warnings: Vec<String>,
}

impl SyncReport {
    pub(crate) fn from_resolution(resolution: &Resolution, published: bool, elapsed_ms: u64) -> Self {
        Self {
            source: resolution.source,
            degraded: resolution.degraded,
            pattern_count: resolution.snapshot.len(),
            records_fetched: resolution.records_fetched,
            conversion_errors: resolution.conversion_errors,
            elapsed_ms,
            published,
            warnings: resolution.warnings.clone(),
        }
    }
}

/// Point-in-time copy of the orchestrator's sync bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncStateView {
    pub mode: SyncMode,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_source: Option<ResolveSource>,
    pub degraded: bool,
    /// Remote fetch attempts, successful or not
    pub remote_fetches: u64,
    /// Background ticks skipped because a refresh was already in flight
    pub skipped_ticks: u64,
    pub consecutive_failures: u64,
    pub refresh_running: bool,
}

impl SyncStateView {
    pub(crate) fn new(mode: SyncMode) -> Self {
        Self {
            mode,
            last_success: None,
            last_error: None,
            last_source: None,
            degraded: false,
            remote_fetches: 0,
            skipped_ticks: 0,
            consecutive_failures: 0,
            refresh_running: false,
        }
    }
}

/// Errors surfaced at the orchestrator boundary.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("Remote unavailable: {0}")]
    Network(#[from] NetworkError),
    #[error("Cache unavailable: {0}")]
    Cache(#[from] CacheError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Remote returned no usable patterns ({fetched} records, {failed} rejected)")]
    EmptyRemote { fetched: usize, failed: usize },
}

impl SyncError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(e) => e.kind(),
            Self::Cache(e) => e.kind(),
            Self::Configuration(_) => "configuration",
            Self::EmptyRemote { .. } => "empty_remote",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Pattern;
    use chrono::Duration;

    fn published(source: ResolveSource, ids: &[&str], at: DateTime<Utc>) -> Published {
        let patterns = ids.iter().map(|id| Pattern::new(*id, "x").unwrap());
        Published {
            snapshot: Arc::new(Snapshot::build(patterns, 3600, at)),
            source,
            degraded: source == ResolveSource::Default,
            published_at: at,
        }
    }

    #[test]
    fn test_orchestrator_state_display() {
        assert_eq!(format!("{}", OrchestratorState::Created), "Created");
        assert_eq!(format!("{}", OrchestratorState::Running), "Running");
        assert_eq!(format!("{}", OrchestratorState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_supersedes_requires_strictly_newer() {
        let now = Utc::now();
        let current = published(ResolveSource::Cache, &["a"], now);
        let same = published(ResolveSource::Remote, &["a", "b"], now);
        let newer = published(ResolveSource::Remote, &["a", "b"], now + Duration::seconds(1));
        let older = published(ResolveSource::Remote, &["a", "b"], now - Duration::seconds(1));

        assert!(!same.supersedes(&current));
        assert!(newer.supersedes(&current));
        assert!(!older.supersedes(&current));
    }

    #[test]
    fn test_identical_content_is_not_newer() {
        let now = Utc::now();
        let current = published(ResolveSource::Remote, &["a", "b"], now);
        let refetched = published(ResolveSource::Remote, &["a", "b"], now + Duration::seconds(60));
        let from_cache = published(ResolveSource::Cache, &["a", "b"], now + Duration::seconds(60));
        assert!(!refetched.supersedes(&current));
        assert!(!from_cache.supersedes(&current));
    }

    #[test]
    fn test_defaults_never_replace_real_data() {
        let now = Utc::now();
        let cache = published(ResolveSource::Cache, &["a"], now - Duration::days(30));
        let defaults = published(ResolveSource::Default, &["d"], now);
        assert!(!defaults.supersedes(&cache));
        assert!(cache.supersedes(&defaults));
    }

    #[test]
    fn test_anything_replaces_placeholder() {
        let placeholder = Published::placeholder(3600);
        let defaults = published(ResolveSource::Default, &["d"], Utc::now());
        assert!(defaults.supersedes(&placeholder));
    }

    #[test]
    fn test_sync_error_kind() {
        let err: SyncError = NetworkError::Timeout("slow".into()).into();
        assert_eq!(err.kind(), "timeout");
        let err = SyncError::EmptyRemote { fetched: 3, failed: 3 };
        assert_eq!(err.kind(), "empty_remote");
        assert!(err.to_string().contains("3 records"));
    }
}
