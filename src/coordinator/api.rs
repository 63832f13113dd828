// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Manual control surface of the orchestrator.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{debug, info};

use crate::source::{NetworkError, SourceStatistics};
use crate::view::CacheStats;

use super::chain::FORCE_REFRESH;
use super::lifecycle::elapsed_ms;
use super::{Published, Resolution, SyncError, SyncOrchestrator, SyncReport, SyncStateView};

impl SyncOrchestrator {
    /// Walk the configured mode's fallback chain without publishing.
    ///
    /// Remote results are still persisted to the cache when `auto_save_cache`
    /// is set.
    pub async fn resolve(&self) -> Result<Resolution, SyncError> {
        let mode = self.config.sync_mode;
        self.resolve_chain(mode.as_str(), mode.fallback_chain()).await
    }

    /// Resolve remote-first regardless of mode and TTL, then publish if newer.
    ///
    /// Waits for any refresh already in flight. Falls back like `OnlineFirst`,
    /// so it never fails.
    #[tracing::instrument(skip(self))]
    pub async fn force_refresh(&self) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let _guard = self.refresh_lock.lock().await;
        let resolution = self.resolve_chain("force-refresh", FORCE_REFRESH).await?;
        let published = self.publish(&resolution);
        drop(_guard);

        let report = SyncReport::from_resolution(&resolution, published, elapsed_ms(start));
        info!(
            source = %report.source,
            patterns = report.pattern_count,
            published = report.published,
            elapsed_ms = report.elapsed_ms,
            "Forced refresh complete"
        );
        Ok(report)
    }

    /// Statistics of the published snapshot (not the on-disk cache).
    #[must_use]
    pub fn get_cache_stats(&self) -> CacheStats {
        self.view().get_cache_stats()
    }

    #[must_use]
    pub fn sync_state(&self) -> SyncStateView {
        self.sync_state.read().clone()
    }

    /// Establish the remote connection up front, bounded by the connect timeout.
    pub async fn connect_remote(&self) -> Result<(), SyncError> {
        let Some(ref source) = self.source else {
            return Err(NetworkError::Refused("no remote source configured".to_string()).into());
        };
        let timeout = self.config.connect_timeout();
        match tokio::time::timeout(timeout, source.connect()).await {
            Ok(Ok(())) => {
                info!(remote = %source.describe(), "Remote connected");
                Ok(())
            }
            Ok(Err(e)) => {
                crate::metrics::record_error("remote", "connect", e.kind());
                Err(e.into())
            }
            Err(_) => {
                crate::metrics::record_error("remote", "connect", "timeout");
                Err(NetworkError::Timeout(format!(
                    "connect to {} exceeded {}s",
                    source.describe(),
                    timeout.as_secs()
                ))
                .into())
            }
        }
    }

    /// Record counts straight from the remote, bounded by the query timeout.
    pub async fn remote_statistics(&self) -> Result<SourceStatistics, SyncError> {
        let Some(ref source) = self.source else {
            return Err(NetworkError::Refused("no remote source configured".to_string()).into());
        };
        let timeout = self.config.query_timeout();
        tokio::time::timeout(timeout, source.fetch_statistics())
            .await
            .map_err(|_| NetworkError::Timeout(format!("statistics exceeded {}s", timeout.as_secs())))?
            .map_err(SyncError::from)
    }

    /// Swap `resolution` in if it supersedes the published snapshot.
    ///
    /// Readers holding the previous `Arc` keep it; new reads see the new one.
    pub(super) fn publish(&self, resolution: &Resolution) -> bool {
        let candidate = Published {
            snapshot: Arc::clone(&resolution.snapshot),
            source: resolution.source,
            degraded: resolution.degraded,
            published_at: Utc::now(),
        };

        let accepted = self.published.send_if_modified(|current| {
            if candidate.supersedes(current) {
                *current = Arc::new(candidate);
                true
            } else {
                false
            }
        });

        if accepted {
            crate::metrics::record_publish(resolution.source.as_str());
            crate::metrics::set_published_patterns(resolution.snapshot.len());
            crate::metrics::set_degraded(resolution.degraded);
            crate::metrics::set_snapshot_age(resolution.snapshot.age_seconds(Utc::now()));
            debug!(
                source = %resolution.source,
                patterns = resolution.snapshot.len(),
                last_updated = %resolution.snapshot.last_updated(),
                "Published snapshot"
            );
        } else {
            crate::metrics::record_publish_rejected();
            debug!(source = %resolution.source, "Resolved snapshot not newer, kept published");
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PatternSyncConfig, SyncMode};
    use crate::coordinator::ResolveSource;
    use crate::source::{MemorySource, RawRecord, RemoteSource};

    fn records(n: usize) -> Vec<RawRecord> {
        (0..n)
            .map(|i| RawRecord::new(format!("rec-{i}"), format!("failure {i}")))
            .collect()
    }

    async fn orchestrator(
        dir: &tempfile::TempDir,
        mode: SyncMode,
        source: Option<Arc<MemorySource>>,
    ) -> SyncOrchestrator {
        let config = PatternSyncConfig {
            cache_dir: dir.path().join("cache"),
            sync_mode: mode,
            auto_refresh_interval_secs: None,
            ..Default::default()
        };
        let source = source.map(|s| s as Arc<dyn RemoteSource>);
        SyncOrchestrator::new(config, source).await.unwrap()
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_fresh_cache() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::with_records(records(2)));
        let orch = orchestrator(&dir, SyncMode::CacheFirst, Some(source.clone())).await;
        orch.initialize().await.unwrap();
        assert_eq!(source.fetch_calls(), 1);

        source.set_records(records(5));
        let report = orch.force_refresh().await.unwrap();
        assert_eq!(source.fetch_calls(), 2);
        assert_eq!(report.source, ResolveSource::Remote);
        assert!(report.published);
        assert_eq!(report.pattern_count, 5);
        assert_eq!(orch.get_cache_stats().pattern_count, 5);
    }

    #[tokio::test]
    async fn test_force_refresh_in_offline_mode_still_goes_remote() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::with_records(records(1)));
        let orch = orchestrator(&dir, SyncMode::OfflineOnly, Some(source.clone())).await;

        let report = orch.force_refresh().await.unwrap();
        assert_eq!(report.source, ResolveSource::Remote);
        assert_eq!(source.fetch_calls(), 1);
    }

    #[tokio::test]
    async fn test_force_refresh_without_source_serves_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let orch = orchestrator(&dir, SyncMode::OnlineFirst, None).await;
        let report = orch.force_refresh().await.unwrap();
        assert_eq!(report.source, ResolveSource::Default);
        assert!(report.degraded);
        assert!(report.pattern_count > 0);
        assert!(!report.warnings.is_empty());

        let state = orch.sync_state();
        assert_eq!(state.last_source, Some(ResolveSource::Default));
        assert!(state.degraded);
    }

    #[tokio::test]
    async fn test_remote_statistics_and_connect() {
        let dir = tempfile::tempdir().unwrap();
        let mut inactive = RawRecord::new("old", "gone");
        inactive.active = false;
        let mut all = records(3);
        all.push(inactive);
        let source = Arc::new(MemorySource::with_records(all));
        let orch = orchestrator(&dir, SyncMode::OnlineFirst, Some(source)).await;

        orch.connect_remote().await.unwrap();
        let stats = orch.remote_statistics().await.unwrap();
        assert_eq!(stats.total_records, 4);
        assert_eq!(stats.active_records, 3);

        let offline = orchestrator(&tempfile::tempdir().unwrap(), SyncMode::OfflineOnly, None).await;
        assert!(matches!(
            offline.remote_statistics().await,
            Err(SyncError::Network(NetworkError::Refused(_)))
        ));
    }

    #[tokio::test]
    async fn test_include_inactive_reaches_the_converter() {
        let dir = tempfile::tempdir().unwrap();
        let mut retired = RawRecord::new("retired", "legacy failure");
        retired.active = false;
        let source = Arc::new(MemorySource::with_records(vec![
            RawRecord::new("live", "current failure"),
            retired,
        ]));

        let default = orchestrator(&dir, SyncMode::AlwaysOnline, Some(source.clone())).await;
        let resolution = default.resolve().await.unwrap();
        assert_eq!(resolution.snapshot.ids(), vec!["live"]);

        let mut config = PatternSyncConfig {
            cache_dir: dir.path().join("wide"),
            sync_mode: SyncMode::AlwaysOnline,
            auto_refresh_interval_secs: None,
            ..Default::default()
        };
        config.converter.include_inactive = true;
        let source: Arc<dyn RemoteSource> = source;
        let wide = SyncOrchestrator::new(config, Some(source)).await.unwrap();
        let resolution = wide.resolve().await.unwrap();
        assert_eq!(resolution.snapshot.ids(), vec!["live", "retired"]);
        assert_eq!(resolution.conversion_errors, 0);
    }

    #[tokio::test]
    async fn test_publish_rejects_older_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(MemorySource::with_records(records(2)));
        let orch = orchestrator(&dir, SyncMode::OnlineFirst, Some(source)).await;

        let newer = orch.resolve().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let newest = orch.resolve().await.unwrap();

        assert!(orch.publish(&newest));
        assert!(!orch.publish(&newer));
        assert!(Arc::ptr_eq(&orch.view().get_patterns(), &newest.snapshot));
    }
}
