// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fallback chains and the resolver that walks them.
//!
//! Each [`SyncMode`] maps to a fixed, ordered list of [`Fallback`] steps.
//! The resolver tries them in order and returns the first that yields a
//! snapshot. If every step fails, the last error is returned.
//!
//! ```text
//! OfflineOnly   Cache(IgnoreTtl)
//! AlwaysOnline  Remote
//! OnlineFirst   Remote → Cache(AllowStale) → Defaults
//! CacheFirst    Cache(FreshOnly) → Remote → Cache(AllowStale) → Defaults
//! ```

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cache::CacheError;
use crate::config::SyncMode;
use crate::snapshot::Snapshot;
use crate::source::{NetworkError, RecordFilter};

use super::{Resolution, ResolveSource, SyncError, SyncOrchestrator};

/// How a cache step treats the snapshot's TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    /// Expired snapshots are passed over
    FreshOnly,
    /// Expired snapshots are served, flagged degraded
    AllowStale,
    /// TTL is not consulted at all
    IgnoreTtl,
}

/// One step in a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fallback {
    Remote,
    Cache(CachePolicy),
    Defaults,
}

impl Fallback {
    fn label(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Cache(_) => "cache",
            Self::Defaults => "defaults",
        }
    }
}

const OFFLINE_ONLY: &[Fallback] = &[Fallback::Cache(CachePolicy::IgnoreTtl)];
const ALWAYS_ONLINE: &[Fallback] = &[Fallback::Remote];
const ONLINE_FIRST: &[Fallback] = &[
    Fallback::Remote,
    Fallback::Cache(CachePolicy::AllowStale),
    Fallback::Defaults,
];
const CACHE_FIRST: &[Fallback] = &[
    Fallback::Cache(CachePolicy::FreshOnly),
    Fallback::Remote,
    Fallback::Cache(CachePolicy::AllowStale),
    Fallback::Defaults,
];

/// Chain used by manual refreshes regardless of the configured mode.
pub const FORCE_REFRESH: &[Fallback] = ONLINE_FIRST;

impl SyncMode {
    #[must_use]
    pub fn fallback_chain(&self) -> &'static [Fallback] {
        match self {
            Self::OfflineOnly => OFFLINE_ONLY,
            Self::AlwaysOnline => ALWAYS_ONLINE,
            Self::OnlineFirst => ONLINE_FIRST,
            Self::CacheFirst => CACHE_FIRST,
        }
    }
}

/// A successful remote fetch, converted.
struct RemoteFetch {
    snapshot: Snapshot,
    records_fetched: usize,
    conversion_errors: usize,
}

impl SyncOrchestrator {
    /// Walk `chain` and return the first usable snapshot.
    ///
    /// The disk cache is read at most once per walk, so the stale-cache step
    /// after a failed remote reuses what the fresh-cache step already loaded.
    #[tracing::instrument(skip(self, chain))]
    pub(super) async fn resolve_chain(
        &self,
        label: &str,
        chain: &[Fallback],
    ) -> Result<Resolution, SyncError> {
        let _timer = crate::metrics::LatencyTimer::new("orchestrator", "resolve");
        let mut cached: Option<Result<Arc<Snapshot>, CacheError>> = None;
        let mut warnings = Vec::new();
        let mut last_error: Option<SyncError> = None;

        for step in chain {
            match *step {
                Fallback::Remote => match self.fetch_remote().await {
                    Ok(fetch) => {
                        let snapshot = Arc::new(fetch.snapshot);
                        if self.config.auto_save_cache {
                            // Best effort: the fetched data is served either way
                            if let Err(e) = self.cache.save(&snapshot).await {
                                warnings.push(format!("cache save failed: {e}"));
                            }
                        }
                        return Ok(self.resolved(label, Resolution {
                            snapshot,
                            source: ResolveSource::Remote,
                            degraded: false,
                            warnings,
                            records_fetched: fetch.records_fetched,
                            conversion_errors: fetch.conversion_errors,
                        }));
                    }
                    Err(e) => {
                        warn!(error = %e, "Remote fetch failed");
                        crate::metrics::record_fallback(step.label(), e.kind());
                        warnings.push(format!("remote: {e}"));
                        last_error = Some(e);
                    }
                },

                Fallback::Cache(policy) => {
                    let loaded = match cached {
                        Some(ref loaded) => loaded.clone(),
                        None => {
                            let loaded = self.load_cache().await.map(Arc::new);
                            cached = Some(loaded.clone());
                            loaded
                        }
                    };

                    let snapshot = match loaded {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            if !matches!(e, CacheError::NotFound(_)) {
                                warn!(error = %e, "Cache unusable");
                            }
                            crate::metrics::record_fallback(step.label(), e.kind());
                            warnings.push(format!("cache: {e}"));
                            last_error = Some(e.into());
                            continue;
                        }
                    };

                    let now = Utc::now();
                    let expired = snapshot.is_expired_at(now);
                    if policy != CachePolicy::IgnoreTtl && snapshot.is_empty() {
                        debug!("Cached snapshot is empty, passing over it");
                        crate::metrics::record_fallback(step.label(), "empty");
                        continue;
                    }
                    if policy == CachePolicy::FreshOnly && expired {
                        debug!(
                            age_seconds = snapshot.age_seconds(now),
                            ttl_seconds = snapshot.ttl_seconds(),
                            "Cached snapshot expired"
                        );
                        crate::metrics::record_fallback(step.label(), "expired");
                        continue;
                    }

                    let degraded = policy == CachePolicy::AllowStale && expired;
                    if degraded {
                        warn!(
                            age_seconds = snapshot.age_seconds(now),
                            "Serving expired cache"
                        );
                        warnings.push(format!(
                            "serving expired cache ({}s old, ttl {}s)",
                            snapshot.age_seconds(now),
                            snapshot.ttl_seconds()
                        ));
                    }
                    return Ok(self.resolved(label, Resolution {
                        snapshot,
                        source: ResolveSource::Cache,
                        degraded,
                        warnings,
                        records_fetched: 0,
                        conversion_errors: 0,
                    }));
                }

                Fallback::Defaults => {
                    warn!("Falling back to built-in default patterns");
                    warnings.push("serving built-in default patterns".to_string());
                    return Ok(self.resolved(label, Resolution {
                        snapshot: self.default_snapshot(),
                        source: ResolveSource::Default,
                        degraded: true,
                        warnings,
                        records_fetched: 0,
                        conversion_errors: 0,
                    }));
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            SyncError::Cache(CacheError::NotFound(self.cache.cache_path()))
        });
        crate::metrics::record_resolution_failure(label, error.kind());
        {
            let mut state = self.sync_state.write();
            state.last_error = Some(error.to_string());
            state.consecutive_failures += 1;
        }
        Err(error)
    }

    fn resolved(&self, label: &str, resolution: Resolution) -> Resolution {
        crate::metrics::record_resolution(label, resolution.source.as_str(), resolution.degraded);
        info!(
            source = %resolution.source,
            degraded = resolution.degraded,
            patterns = resolution.snapshot.len(),
            "Patterns resolved"
        );

        let mut state = self.sync_state.write();
        state.last_success = Some(Utc::now());
        state.last_source = Some(resolution.source);
        state.degraded = resolution.degraded;
        state.consecutive_failures = 0;
        if !resolution.degraded && resolution.warnings.is_empty() {
            state.last_error = None;
        } else if let Some(w) = resolution.warnings.last() {
            state.last_error = Some(w.clone());
        }
        drop(state);

        resolution
    }

    /// Fetch, bounded by the query timeout, and convert.
    async fn fetch_remote(&self) -> Result<RemoteFetch, SyncError> {
        let Some(ref source) = self.source else {
            return Err(NetworkError::Refused("no remote source configured".to_string()).into());
        };
        self.sync_state.write().remote_fetches += 1;

        let _timer = crate::metrics::LatencyTimer::new("remote", "fetch");
        let timeout = self.config.query_timeout();
        let filter = self.remote_filter();
        let fetched = tokio::time::timeout(timeout, source.fetch_all(filter.as_ref())).await;
        let records = match fetched {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => {
                crate::metrics::record_remote_fetch(e.kind(), 0);
                return Err(e.into());
            }
            Err(_) => {
                crate::metrics::record_remote_fetch("timeout", 0);
                return Err(NetworkError::Timeout(format!(
                    "fetch from {} exceeded {}s",
                    source.describe(),
                    timeout.as_secs()
                ))
                .into());
            }
        };
        crate::metrics::record_remote_fetch("success", records.len());

        let result = self.converter.convert_batch(&records);
        if result.patterns.is_empty() {
            return Err(SyncError::EmptyRemote {
                fetched: records.len(),
                failed: result.errors.len(),
            });
        }

        let records_fetched = records.len();
        let conversion_errors = result.errors.len();
        Ok(RemoteFetch {
            snapshot: Snapshot::build(result.patterns, self.config.cache_ttl_seconds, Utc::now()),
            records_fetched,
            conversion_errors,
        })
    }

    /// The configured filter, widened to inactive records when the converter wants them.
    fn remote_filter(&self) -> Option<RecordFilter> {
        if !self.config.converter.include_inactive {
            return self.config.filter.clone();
        }
        Some(self.config.filter.clone().unwrap_or_default().include_inactive(true))
    }

    /// Load the primary cache, recovering from the backup if it is damaged.
    async fn load_cache(&self) -> Result<Snapshot, CacheError> {
        match self.cache.load().await {
            Err(e) if e.is_damaged() && self.config.recover_from_backup => {
                match self.cache.load_backup().await {
                    Ok(snapshot) => {
                        warn!(error = %e, patterns = snapshot.len(), "Primary cache damaged, recovered from backup");
                        crate::metrics::record_cache_operation("recover", "success");
                        Ok(snapshot)
                    }
                    Err(backup_err) => {
                        debug!(error = %backup_err, "Backup cache unusable too");
                        crate::metrics::record_cache_operation("recover", backup_err.kind());
                        Err(e)
                    }
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chains_per_mode() {
        assert_eq!(
            SyncMode::OfflineOnly.fallback_chain(),
            &[Fallback::Cache(CachePolicy::IgnoreTtl)]
        );
        assert_eq!(SyncMode::AlwaysOnline.fallback_chain(), &[Fallback::Remote]);
        assert_eq!(SyncMode::OnlineFirst.fallback_chain()[0], Fallback::Remote);
        assert_eq!(
            SyncMode::CacheFirst.fallback_chain(),
            &[
                Fallback::Cache(CachePolicy::FreshOnly),
                Fallback::Remote,
                Fallback::Cache(CachePolicy::AllowStale),
                Fallback::Defaults,
            ]
        );
    }

    #[test]
    fn test_only_offline_and_always_online_can_fail() {
        for mode in [SyncMode::OnlineFirst, SyncMode::CacheFirst] {
            assert_eq!(mode.fallback_chain().last(), Some(&Fallback::Defaults));
        }
        for mode in [SyncMode::OfflineOnly, SyncMode::AlwaysOnline] {
            assert!(!mode.fallback_chain().contains(&Fallback::Defaults));
        }
        assert!(!SyncMode::OfflineOnly.fallback_chain().contains(&Fallback::Remote));
        assert!(!SyncMode::AlwaysOnline
            .fallback_chain()
            .iter()
            .any(|f| matches!(f, Fallback::Cache(_))));
    }

    #[test]
    fn test_force_refresh_goes_remote_first() {
        assert_eq!(FORCE_REFRESH.first(), Some(&Fallback::Remote));
        assert_eq!(FORCE_REFRESH.last(), Some(&Fallback::Defaults));
    }
}
