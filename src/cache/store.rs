// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::CacheError;
use crate::pattern::{Pattern, PatternDocument};
use crate::snapshot::{content_checksum, Snapshot, SnapshotMetadata, SCHEMA_VERSION};

pub const CACHE_FILE: &str = "patterns.json";
pub const BACKUP_FILE: &str = "patterns.backup.json";
/// In-flight writes are `patterns.json.<random>.tmp`, unique per writer.
pub const TEMP_PREFIX: &str = "patterns.json.";
pub const TEMP_SUFFIX: &str = ".tmp";
const PROBE_FILE: &str = ".write_probe";

#[derive(Serialize, Deserialize)]
struct CacheFile {
    metadata: SnapshotMetadata,
    patterns: BTreeMap<String, PatternDocument>,
}

/// Crash-safe on-disk snapshot store.
///
/// Saves are serialized by an async mutex and follow
/// temp-write → fsync → backup copy → rename, so a reader (or a crash) only
/// ever observes the old or the new complete file. Loads take no lock.
pub struct CacheStore {
    dir: PathBuf,
    ttl_seconds: u64,
    write_lock: Mutex<()>,
}

impl CacheStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ttl_seconds: u64) -> Self {
        Self {
            dir: dir.into(),
            ttl_seconds,
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// TTL stamped on snapshots built for this store.
    #[must_use]
    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.dir.join(CACHE_FILE)
    }

    #[must_use]
    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    /// Temp files currently in the directory: in-flight writes, or debris
    /// from a crash mid-save.
    pub async fn temp_files(&self) -> Result<Vec<PathBuf>, CacheError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| CacheError::from_io(&self.dir, &e))?;
        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CacheError::from_io(&self.dir, &e))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX) {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Create the cache directory and prove it is writable.
    pub async fn initialize(&self) -> Result<(), CacheError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| CacheError::from_io(&self.dir, &e))?;

        let probe = self.dir.join(PROBE_FILE);
        tokio::fs::write(&probe, b"ok")
            .await
            .map_err(|e| CacheError::from_io(&probe, &e))?;
        if let Err(e) = tokio::fs::remove_file(&probe).await {
            debug!(path = %probe.display(), error = %e, "Failed to remove write probe");
        }

        debug!(dir = %self.dir.display(), "Cache directory ready");
        Ok(())
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.cache_path()).await.unwrap_or(false)
    }

    /// `now - last_updated > ttl`, using the TTL recorded in the snapshot.
    #[must_use]
    pub fn is_expired(snapshot: &Snapshot, now: DateTime<Utc>) -> bool {
        snapshot.is_expired_at(now)
    }

    /// Load and verify the current cache file.
    pub async fn load(&self) -> Result<Snapshot, CacheError> {
        let _timer = crate::metrics::LatencyTimer::new("cache", "load");
        let result = read_snapshot(&self.cache_path()).await;
        record_load(&result, "load");
        result
    }

    /// Load and verify the backup file (the previous snapshot).
    pub async fn load_backup(&self) -> Result<Snapshot, CacheError> {
        let result = read_snapshot(&self.backup_path()).await;
        record_load(&result, "load_backup");
        result
    }

    /// Persist `snapshot` atomically, keeping the previous file as backup.
    #[tracing::instrument(skip(self, snapshot), fields(patterns = snapshot.len()))]
    pub async fn save(&self, snapshot: &Snapshot) -> Result<(), CacheError> {
        let _timer = crate::metrics::LatencyTimer::new("cache", "save");
        let _guard = self.write_lock.lock().await;

        let result = self.save_locked(snapshot).await;
        match result {
            Ok(()) => {
                crate::metrics::record_cache_operation("save", "success");
                info!(
                    path = %self.cache_path().display(),
                    patterns = snapshot.len(),
                    last_updated = %snapshot.last_updated(),
                    "Pattern cache saved"
                );
            }
            Err(ref e) => {
                crate::metrics::record_cache_operation("save", e.kind());
                warn!(error = %e, "Pattern cache save failed");
            }
        }
        result
    }

    async fn save_locked(&self, snapshot: &Snapshot) -> Result<(), CacheError> {
        let bytes = encode(snapshot, &self.cache_path())?;
        let temp = write_temp(&self.dir, TEMP_PREFIX, bytes).await?;

        let target = self.cache_path();
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            let backup = self.backup_path();
            if let Err(e) = tokio::fs::copy(&target, &backup).await {
                warn!(path = %backup.display(), error = %e, "Failed to refresh cache backup");
            }
        }

        persist(temp, &target).await?;
        sync_dir(&self.dir).await;
        Ok(())
    }

    /// Remove the cache, its backup and any leftover temp files.
    pub async fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock().await;
        let mut paths = vec![self.cache_path(), self.backup_path()];
        paths.extend(self.temp_files().await?);
        for path in paths {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => debug!(path = %path.display(), "Removed cache file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::from_io(&path, &e)),
            }
        }
        crate::metrics::record_cache_operation("clear", "success");
        info!(dir = %self.dir.display(), "Pattern cache cleared");
        Ok(())
    }

    /// Write `snapshot` to an arbitrary file in the cache format.
    pub async fn export(&self, path: &Path, snapshot: &Snapshot) -> Result<(), CacheError> {
        let bytes = encode(snapshot, path)?;
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let prefix = format!(
            "{}.",
            path.file_name().map_or_else(|| "export".into(), |n| n.to_string_lossy())
        );

        let temp = write_temp(dir, &prefix, bytes).await?;
        persist(temp, path).await?;
        crate::metrics::record_cache_operation("export", "success");
        info!(path = %path.display(), patterns = snapshot.len(), "Pattern snapshot exported");
        Ok(())
    }

    /// Serialize `snapshot` in the cache file format.
    pub fn encode_bytes(snapshot: &Snapshot) -> Result<Vec<u8>, CacheError> {
        encode(snapshot, Path::new(CACHE_FILE))
    }

    /// Parse and verify cache-format bytes, as [`load`](Self::load) does.
    pub fn decode_bytes(bytes: &[u8]) -> Result<Snapshot, CacheError> {
        decode(bytes, Path::new(CACHE_FILE))
    }

    /// Read and verify a file produced by [`export`](Self::export). Does not save it.
    pub async fn import(&self, path: &Path) -> Result<Snapshot, CacheError> {
        let result = read_snapshot(path).await;
        record_load(&result, "import");
        result
    }
}

fn record_load(result: &Result<Snapshot, CacheError>, operation: &str) {
    match result {
        Ok(snapshot) => {
            crate::metrics::record_cache_operation(operation, "success");
            debug!(operation, patterns = snapshot.len(), "Pattern cache read");
        }
        Err(CacheError::NotFound(path)) => {
            crate::metrics::record_cache_operation(operation, "not_found");
            debug!(operation, path = %path.display(), "No pattern cache on disk");
        }
        Err(e) => {
            crate::metrics::record_cache_operation(operation, e.kind());
            warn!(operation, error = %e, "Pattern cache unreadable");
        }
    }
}

/// Write `bytes` to a fresh uniquely named temp file in `dir` and fsync it.
///
/// The file is removed when the returned handle drops without being persisted.
async fn write_temp(dir: &Path, prefix: &str, bytes: Vec<u8>) -> Result<NamedTempFile, CacheError> {
    let dir = dir.to_path_buf();
    let prefix = prefix.to_string();
    let join_path = dir.clone();
    tokio::task::spawn_blocking(move || {
        let mut file = tempfile::Builder::new()
            .prefix(&prefix)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(&dir)
            .map_err(|e| CacheError::from_io(&dir, &e))?;
        file.write_all(&bytes)
            .map_err(|e| CacheError::from_io(file.path(), &e))?;
        file.as_file()
            .sync_all()
            .map_err(|e| CacheError::from_io(file.path(), &e))?;
        Ok(file)
    })
    .await
    .map_err(|e| CacheError::Io {
        path: join_path,
        message: format!("temp write task failed: {e}"),
    })?
}

/// Rename `temp` over `target`. On failure the temp file is removed.
async fn persist(temp: NamedTempFile, target: &Path) -> Result<(), CacheError> {
    let target = target.to_path_buf();
    let join_path = target.clone();
    tokio::task::spawn_blocking(move || {
        temp.persist(&target)
            .map(|_| ())
            .map_err(|e| CacheError::from_io(&target, &e.error))
    })
    .await
    .map_err(|e| CacheError::Io {
        path: join_path,
        message: format!("rename task failed: {e}"),
    })?
}

/// Persist a rename in `dir` itself. Best effort; not every platform allows it.
async fn sync_dir(dir: &Path) {
    let result = match tokio::fs::File::open(dir).await {
        Ok(handle) => handle.sync_all().await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        debug!(path = %dir.display(), error = %e, "Failed to sync cache directory");
    }
}

async fn read_snapshot(path: &Path) -> Result<Snapshot, CacheError> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CacheError::from_io(path, &e))?;
    decode(&bytes, path)
}

fn encode(snapshot: &Snapshot, path: &Path) -> Result<Vec<u8>, CacheError> {
    let file = CacheFile {
        metadata: snapshot.metadata().clone(),
        patterns: snapshot.to_documents(),
    };
    serde_json::to_vec_pretty(&file).map_err(|e| CacheError::Io {
        path: path.to_path_buf(),
        message: format!("failed to encode snapshot: {e}"),
    })
}

/// Parse and verify: schema version, count, key/id agreement, checksum, then compile.
fn decode(bytes: &[u8], path: &Path) -> Result<Snapshot, CacheError> {
    let file: CacheFile =
        serde_json::from_slice(bytes).map_err(|e| CacheError::corrupt(path, e.to_string()))?;

    if file.metadata.version != SCHEMA_VERSION {
        return Err(CacheError::corrupt(
            path,
            format!("unsupported schema version '{}'", file.metadata.version),
        ));
    }
    if file.metadata.pattern_count != file.patterns.len() {
        return Err(CacheError::corrupt(
            path,
            format!(
                "metadata declares {} patterns, file holds {}",
                file.metadata.pattern_count,
                file.patterns.len()
            ),
        ));
    }
    if let Some((key, doc)) = file.patterns.iter().find(|(key, doc)| *key != &doc.id) {
        return Err(CacheError::corrupt(
            path,
            format!("entry '{}' holds pattern '{}'", key, doc.id),
        ));
    }

    let actual = content_checksum(file.patterns.values().cloned());
    if actual != file.metadata.checksum {
        crate::metrics::record_error("cache", "load", "checksum_mismatch");
        return Err(CacheError::ChecksumMismatch {
            path: path.to_path_buf(),
            expected: file.metadata.checksum,
            actual,
        });
    }

    let mut patterns = BTreeMap::new();
    for (id, doc) in file.patterns {
        let pattern = Pattern::try_from(doc)
            .map_err(|e| CacheError::corrupt(path, format!("pattern '{id}': {e}")))?;
        patterns.insert(id, Arc::new(pattern));
    }

    Ok(Snapshot::from_verified_parts(file.metadata, patterns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::Severity;
    use chrono::Duration;

    fn snapshot(ids: &[&str], at: DateTime<Utc>) -> Snapshot {
        let patterns = ids.iter().map(|id| {
            Pattern::new(*id, &format!(r"{id} failed: (?P<reason>.+)"))
                .unwrap()
                .with_severity(Severity::Warning)
                .with_product("gateway")
                .with_category("network")
                .with_action("restart it")
        });
        Snapshot::build(patterns, 3600, at)
    }

    fn store(dir: &tempfile::TempDir) -> CacheStore {
        CacheStore::new(dir.path().join("cache"), 3600)
    }

    #[tokio::test]
    async fn test_save_then_load_is_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();

        let original = snapshot(&["a", "b", "c"], Utc::now());
        store.save(&original).await.unwrap();
        let loaded = store.load().await.unwrap();

        assert_eq!(loaded, original);
        assert!(store.temp_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        assert!(matches!(store.load().await, Err(CacheError::NotFound(_))));
        assert!(!store.exists().await);
    }

    #[tokio::test]
    async fn test_second_save_keeps_backup() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();

        let first = snapshot(&["a"], Utc::now() - Duration::seconds(10));
        let second = snapshot(&["a", "b"], Utc::now());
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        assert_eq!(store.load().await.unwrap(), second);
        assert_eq!(store.load_backup().await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        tokio::fs::write(store.cache_path(), b"{\"metadata\": {\"vers").await.unwrap();
        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { .. }), "got {err:?}");
        assert!(err.is_damaged());
    }

    #[tokio::test]
    async fn test_tampered_pattern_is_checksum_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        store.save(&snapshot(&["a", "b"], Utc::now())).await.unwrap();

        let text = tokio::fs::read_to_string(store.cache_path()).await.unwrap();
        let tampered = text.replace("restart it", "ignore it");
        assert_ne!(text, tampered);
        tokio::fs::write(store.cache_path(), tampered).await.unwrap();

        assert!(matches!(store.load().await, Err(CacheError::ChecksumMismatch { .. })));
    }

    #[tokio::test]
    async fn test_count_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        store.save(&snapshot(&["a", "b"], Utc::now())).await.unwrap();

        let text = tokio::fs::read_to_string(store.cache_path()).await.unwrap();
        let tampered = text.replace("\"pattern_count\": 2", "\"pattern_count\": 3");
        tokio::fs::write(store.cache_path(), tampered).await.unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt { ref reason, .. } if reason.contains("declares 3")));
    }

    #[tokio::test]
    async fn test_unknown_schema_version_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        store.save(&snapshot(&["a"], Utc::now())).await.unwrap();

        let text = tokio::fs::read_to_string(store.cache_path()).await.unwrap();
        tokio::fs::write(store.cache_path(), text.replace("\"version\": \"1\"", "\"version\": \"99\""))
            .await
            .unwrap();
        assert!(matches!(store.load().await, Err(CacheError::Corrupt { .. })));
    }

    #[tokio::test]
    async fn test_leftover_temp_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();
        let saved = snapshot(&["a"], Utc::now());
        store.save(&saved).await.unwrap();

        // A crash mid-write leaves a truncated temp file behind
        let debris = store.dir().join(format!("{TEMP_PREFIX}crashed{TEMP_SUFFIX}"));
        tokio::fs::write(&debris, b"{\"metadata\":").await.unwrap();
        assert_eq!(store.load().await.unwrap(), saved);
        assert_eq!(store.temp_files().await.unwrap(), vec![debris.clone()]);

        store.clear().await.unwrap();
        assert!(!tokio::fs::try_exists(&debris).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_saves_leave_a_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));
        store.initialize().await.unwrap();

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let ids: Vec<String> = (0..=i).map(|n| format!("p{n}")).collect();
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                store.save(&snapshot(&refs, Utc::now())).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded.metadata().pattern_count, loaded.len());
        assert!(loaded.len() >= 1 && loaded.len() <= 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_loads_during_saves_see_complete_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(store(&dir));
        store.initialize().await.unwrap();
        store.save(&snapshot(&["seed"], Utc::now())).await.unwrap();

        let writer = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                for i in 1..=100usize {
                    let ids: Vec<String> = (0..(i % 40) + 1).map(|n| format!("p{n}")).collect();
                    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    store.save(&snapshot(&refs, Utc::now())).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            readers.push(tokio::spawn(async move {
                let mut loads = 0;
                for _ in 0..250 {
                    let loaded = store.load().await.expect("load during save");
                    assert_eq!(loaded.metadata().pattern_count, loaded.len());
                    loads += 1;
                    tokio::task::yield_now().await;
                }
                loads
            }));
        }

        writer.await.unwrap();
        let mut total = 0;
        for reader in readers {
            total += reader.await.unwrap();
        }
        assert_eq!(total, 1000);
        assert!(store.temp_files().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_stores_sharing_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let first = Arc::new(store(&dir));
        let second = Arc::new(store(&dir));
        first.initialize().await.unwrap();

        let mut handles = Vec::new();
        for (n, store) in [first.clone(), second.clone()].into_iter().enumerate() {
            handles.push(tokio::spawn(async move {
                for i in 0..30usize {
                    let ids: Vec<String> = (0..=(i + n) % 12).map(|k| format!("s{n}-{k}")).collect();
                    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                    store.save(&snapshot(&refs, Utc::now())).await.unwrap();
                    let loaded = store.load().await.unwrap();
                    assert_eq!(loaded.metadata().pattern_count, loaded.len());
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let loaded = second.load().await.unwrap();
        assert_eq!(loaded.metadata().pattern_count, loaded.len());
        assert!(first.temp_files().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_import_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();

        let original = snapshot(&["x", "y"], Utc::now());
        let export_path = dir.path().join("exported.json");
        store.export(&export_path, &original).await.unwrap();
        assert_eq!(store.import(&export_path).await.unwrap(), original);

        store.save(&original).await.unwrap();
        store.save(&original).await.unwrap();
        store.clear().await.unwrap();
        assert!(!store.exists().await);
        assert!(matches!(store.load_backup().await, Err(CacheError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_directory_sync_failure_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        // Logged and swallowed; the rename already happened
        sync_dir(&dir.path().join("missing")).await;
        sync_dir(dir.path()).await;
    }

    #[tokio::test]
    async fn test_failed_save_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.initialize().await.unwrap();

        // A directory squatting on the target makes the final rename fail
        tokio::fs::create_dir_all(store.cache_path().join("occupied")).await.unwrap();
        let err = store.save(&snapshot(&["a"], Utc::now())).await.unwrap_err();
        assert!(!matches!(err, CacheError::NotFound(_)), "got {err:?}");
        assert!(store.temp_files().await.unwrap().is_empty());
    }

    #[test]
    fn test_expiry_uses_snapshot_ttl() {
        let now = Utc::now();
        let fresh = snapshot(&["a"], now - Duration::seconds(3599));
        let stale = snapshot(&["a"], now - Duration::seconds(3601));
        assert!(!CacheStore::is_expired(&fresh, now));
        assert!(CacheStore::is_expired(&stale, now));
    }
}
