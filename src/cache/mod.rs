// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable local cache of the last good snapshot.
//!
//! # File layout
//!
//! ```text
//! <cache_dir>/
//!   patterns.json          ← current snapshot (only ever replaced by rename)
//!   patterns.backup.json   ← previous snapshot
//!   patterns.json.*.tmp    ← in-flight writes, one per writer, never read
//! ```
//!
//! ```json
//! {
//!   "metadata": { "version": "1", "created_at": "...", "last_updated": "...",
//!                 "pattern_count": 2, "ttl_seconds": 3600,
//!                 "products": [...], "categories": [...], "checksum": "<sha256>" },
//!   "patterns": { "<id>": { "id": "<id>", "expression": "...", ... } }
//! }
//! ```

mod store;

use std::path::{Path, PathBuf};

use thiserror::Error;

pub use store::{CacheStore, BACKUP_FILE, CACHE_FILE, TEMP_PREFIX, TEMP_SUFFIX};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache file not found: {0}")]
    NotFound(PathBuf),
    #[error("Cache file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("Checksum mismatch in {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },
    #[error("Cache I/O error on {path}: {message}")]
    Io { path: PathBuf, message: String },
}

impl CacheError {
    pub(crate) fn from_io(path: &Path, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        }
    }

    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        Self::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Corrupt { .. } => "corrupt",
            Self::PermissionDenied(_) => "permission_denied",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Io { .. } => "io",
        }
    }

    /// The file exists but its content can't be trusted.
    #[must_use]
    pub fn is_damaged(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::ChecksumMismatch { .. })
    }
}
