// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync orchestrator.
//!
//! The [`SyncOrchestrator`] ties the components together: it resolves a
//! snapshot by walking the configured mode's fallback chain (remote source,
//! disk cache, built-in defaults), persists remote results, and publishes the
//! result to consumers through a watch channel.
//!
//! # Lifecycle
//!
//! ```text
//! Created → Initializing → Ready → Running → ShuttingDown
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pattern_sync::{PatternSyncConfig, SyncOrchestrator, OrchestratorState};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let config = PatternSyncConfig::default();
//! let orchestrator = Arc::new(SyncOrchestrator::from_config(config).await.expect("config"));
//! assert_eq!(orchestrator.state(), OrchestratorState::Created);
//!
//! let report = orchestrator.initialize().await.expect("initial resolve");
//! println!("{} patterns from {}", report.pattern_count, report.source);
//!
//! let view = orchestrator.view();
//! let patterns = view.get_patterns();
//! # let _ = patterns;
//! orchestrator.start_auto_refresh();
//! orchestrator.shutdown().await;
//! # }
//! ```

mod api;
mod chain;
mod lifecycle;
mod types;

pub use chain::{CachePolicy, Fallback, FORCE_REFRESH};
pub use types::{
    OrchestratorState, Published, Resolution, ResolveSource, SyncError, SyncReport, SyncStateView,
};

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::config::{ConfigError, PatternSyncConfig};
use crate::converter::PatternConverter;
use crate::snapshot::Snapshot;
use crate::source::RemoteSource;
use crate::view::ConsumerView;

/// Resolves, persists and publishes pattern snapshots.
///
/// # Thread Safety
///
/// `Send + Sync`; share it as `Arc<SyncOrchestrator>`. Readers go through
/// [`ConsumerView`], which never blocks on I/O. Resolve-and-publish is
/// single-writer: manual calls wait their turn, background ticks skip.
pub struct SyncOrchestrator {
    pub(super) config: PatternSyncConfig,

    /// Remote source (None = cache and defaults only)
    pub(super) source: Option<Arc<dyn RemoteSource>>,

    pub(super) converter: PatternConverter,

    pub(super) cache: Arc<CacheStore>,

    /// Published snapshot (hot-swapped, broadcast to views)
    pub(super) published: watch::Sender<Arc<Published>>,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<OrchestratorState>,
    pub(super) state_rx: watch::Receiver<OrchestratorState>,

    /// Serializes resolve + publish
    pub(super) refresh_lock: Mutex<()>,

    pub(super) sync_state: RwLock<SyncStateView>,

    /// Background refresh task and its cancellation token
    pub(super) refresh_task: SyncMutex<Option<(CancellationToken, JoinHandle<()>)>>,

    /// Built-in defaults, stamped once so repeated fallbacks compare equal
    pub(super) defaults: OnceLock<Arc<Snapshot>>,
}

impl SyncOrchestrator {
    /// Create an orchestrator around an explicit source.
    ///
    /// Validates the configuration and prepares the cache directory; an
    /// unwritable directory is a configuration error. Does not touch the
    /// network.
    pub async fn new(
        config: PatternSyncConfig,
        source: Option<Arc<dyn RemoteSource>>,
    ) -> Result<Self, SyncError> {
        config.validate()?;

        let cache = Arc::new(CacheStore::new(config.cache_dir.clone(), config.cache_ttl_seconds));
        cache.initialize().await.map_err(|e| ConfigError::UnwritableCacheDir {
            path: config.cache_dir.clone(),
            reason: e.to_string(),
        })?;

        let (published, _) = watch::channel(Arc::new(Published::placeholder(config.cache_ttl_seconds)));
        let (state_tx, state_rx) = watch::channel(OrchestratorState::Created);

        info!(
            mode = %config.sync_mode,
            remote = source.as_ref().map(|s| s.describe()).unwrap_or_else(|| "none".to_string()),
            cache_dir = %config.cache_dir.display(),
            "Sync orchestrator created"
        );

        Ok(Self {
            converter: PatternConverter::new(config.converter.clone()),
            sync_state: RwLock::new(SyncStateView::new(config.sync_mode)),
            config,
            source,
            cache,
            published,
            state: state_tx,
            state_rx,
            refresh_lock: Mutex::new(()),
            refresh_task: SyncMutex::new(None),
            defaults: OnceLock::new(),
        })
    }

    /// Create an orchestrator, picking the source backend from `remote_url`.
    pub async fn from_config(config: PatternSyncConfig) -> Result<Self, SyncError> {
        let source = crate::source::from_config(&config)?;
        Self::new(config, source).await
    }

    #[must_use]
    pub fn config(&self) -> &PatternSyncConfig {
        &self.config
    }

    /// The on-disk cache this orchestrator persists to.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Get current lifecycle state.
    #[must_use]
    pub fn state(&self) -> OrchestratorState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<OrchestratorState> {
        self.state_rx.clone()
    }

    /// Check if a snapshot has been published.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self.state(), OrchestratorState::Ready | OrchestratorState::Running)
    }

    /// A read handle onto the published snapshot. Cheap; clone freely.
    #[must_use]
    pub fn view(&self) -> ConsumerView {
        ConsumerView::new(self.published.subscribe())
    }

    pub(super) fn set_state(&self, state: OrchestratorState) {
        let _ = self.state.send(state);
        crate::metrics::set_orchestrator_state(&state.to_string());
        debug!(%state, "Orchestrator state changed");
    }

    pub(super) fn default_snapshot(&self) -> Arc<Snapshot> {
        self.defaults
            .get_or_init(|| {
                Arc::new(crate::defaults::default_snapshot(self.config.cache_ttl_seconds, Utc::now()))
            })
            .clone()
    }
}
