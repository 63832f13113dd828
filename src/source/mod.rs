// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Remote pattern sources.
//!
//! - [`SqlSource`]: MySQL / SQLite collection table via the sqlx `Any` pool
//! - [`RedisSource`]: JSON documents under a key namespace
//! - [`MemorySource`]: in-process catalogue with failure injection

pub mod traits;
pub mod sql;
pub mod redis;
pub mod memory;

use std::sync::Arc;

pub use traits::{
    ExternalReferences, NetworkError, RawParameter, RawRecord, RecordFilter, RemoteSource,
    SourceStatistics, VersionInfo,
};
pub use sql::{PoolSettings, SqlSource};
pub use self::redis::RedisSource;
pub use memory::MemorySource;

use crate::config::{ConfigError, PatternSyncConfig};

/// Build the source named by `config.remote_url`, picking the backend from
/// the URL scheme. `None` when no remote is configured. Does not connect.
pub fn from_config(config: &PatternSyncConfig) -> Result<Option<Arc<dyn RemoteSource>>, ConfigError> {
    let Some(ref url) = config.remote_url else {
        return Ok(None);
    };

    let source: Arc<dyn RemoteSource> = if url.starts_with("redis://") || url.starts_with("rediss://") {
        Arc::new(RedisSource::from_config(url, config))
    } else if url.starts_with("sqlite:") || url.starts_with("mysql://") || url.starts_with("mariadb://") {
        Arc::new(SqlSource::from_config(url, config)?)
    } else {
        return Err(ConfigError::InvalidValue {
            key: "remote_url".to_string(),
            reason: format!("unsupported scheme in '{}'", traits::redact_url(url)),
        });
    };
    Ok(Some(source))
}
