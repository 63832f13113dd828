// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Orchestrator lifecycle: initial resolve, background refresh, shutdown.

use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{OrchestratorState, SyncError, SyncOrchestrator, SyncReport};

/// What one background tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum TickOutcome {
    Published,
    Unchanged,
    Failed,
    /// A refresh was already in flight
    Skipped,
}

impl TickOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Unchanged => "unchanged",
            Self::Failed => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl SyncOrchestrator {
    /// Resolve with the configured mode and publish the result.
    ///
    /// Fails only in the two modes without a last-resort fallback
    /// (`OfflineOnly` with no usable cache, `AlwaysOnline` with no remote);
    /// the orchestrator then stays in `Created`.
    #[tracing::instrument(skip(self), fields(mode = %self.config.sync_mode))]
    pub async fn initialize(&self) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        info!("Initializing pattern sync...");
        self.set_state(OrchestratorState::Initializing);

        let _guard = self.refresh_lock.lock().await;
        let mode = self.config.sync_mode;
        let resolution = match self.resolve_chain(mode.as_str(), mode.fallback_chain()).await {
            Ok(resolution) => resolution,
            Err(e) => {
                error!(error = %e, "Initial resolution failed");
                self.set_state(OrchestratorState::Created);
                return Err(e);
            }
        };
        let published = self.publish(&resolution);
        drop(_guard);

        self.set_state(OrchestratorState::Ready);
        crate::metrics::record_lifecycle_phase("initialize", start.elapsed());
        let report = SyncReport::from_resolution(&resolution, published, elapsed_ms(start));
        info!(
            source = %report.source,
            degraded = report.degraded,
            patterns = report.pattern_count,
            elapsed_ms = report.elapsed_ms,
            "Pattern sync ready"
        );
        Ok(report)
    }

    /// Spawn the background refresh task on the configured interval.
    ///
    /// No-op if the interval is disabled or a task is already running. The
    /// task holds only a weak reference, so dropping the last `Arc` ends it.
    pub fn start_auto_refresh(self: &Arc<Self>) {
        let Some(period) = self.config.auto_refresh_interval() else {
            debug!("Auto refresh disabled");
            return;
        };

        let mut slot = self.refresh_task.lock();
        if slot.is_some() {
            debug!("Auto refresh already running");
            return;
        }

        let token = CancellationToken::new();
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(refresh_loop(weak, period, token.clone()));
        *slot = Some((token, handle));
        drop(slot);

        self.sync_state.write().refresh_running = true;
        if self.state() == OrchestratorState::Ready {
            self.set_state(OrchestratorState::Running);
        }
        info!(interval_secs = period.as_secs(), "Auto refresh started");
    }

    /// Cancel the background task and wait for it to exit.
    ///
    /// A resolve in flight at cancellation is abandoned; its result is not
    /// published.
    pub async fn stop_auto_refresh(&self) {
        let task = self.refresh_task.lock().take();
        let Some((token, handle)) = task else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            warn!(error = %e, "Auto refresh task ended abnormally");
        }
        self.sync_state.write().refresh_running = false;
        if self.state() == OrchestratorState::Running {
            self.set_state(OrchestratorState::Ready);
        }
        info!("Auto refresh stopped");
    }

    /// Stop background work. The last published snapshot stays readable.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        let start = Instant::now();
        info!("Shutting down pattern sync...");
        self.set_state(OrchestratorState::ShuttingDown);
        self.stop_auto_refresh().await;
        crate::metrics::record_lifecycle_phase("shutdown", start.elapsed());
        info!("Pattern sync shutdown complete");
    }

    /// One background refresh: resolve with the configured mode and publish
    /// a strictly newer result. Never waits for a refresh already running.
    pub(super) async fn refresh_tick(&self) -> TickOutcome {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            self.sync_state.write().skipped_ticks += 1;
            debug!("Refresh already in flight, skipping tick");
            return TickOutcome::Skipped;
        };

        let mode = self.config.sync_mode;
        match self.resolve_chain(mode.as_str(), mode.fallback_chain()).await {
            Ok(resolution) if self.publish(&resolution) => TickOutcome::Published,
            Ok(_) => TickOutcome::Unchanged,
            Err(e) => {
                warn!(error = %e, "Background refresh failed, keeping published snapshot");
                TickOutcome::Failed
            }
        }
    }
}

async fn refresh_loop(orchestrator: Weak<SyncOrchestrator>, period: std::time::Duration, token: CancellationToken) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(orchestrator) = orchestrator.upgrade() else {
            break;
        };

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!("Refresh cancelled mid-flight, discarding");
                crate::metrics::record_refresh_tick("cancelled");
                break;
            }
            outcome = orchestrator.refresh_tick() => outcome,
        };
        crate::metrics::record_refresh_tick(outcome.as_str());
        if outcome == TickOutcome::Published {
            info!(patterns = orchestrator.view().get_patterns().len(), "Hot-reloaded patterns");
        }
    }
    debug!("Refresh loop exited");
}

pub(super) fn elapsed_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
