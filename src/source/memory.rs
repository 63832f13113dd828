// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::traits::{NetworkError, RawRecord, RecordFilter, RemoteSource, SourceStatistics};

/// In-process record source.
///
/// Useful for embedding a fixed pattern catalogue and for exercising the
/// orchestrator's fallback paths: failures and latency can be injected at
/// any time.
pub struct MemorySource {
    records: RwLock<Vec<RawRecord>>,
    failure: RwLock<Option<NetworkError>>,
    latency: RwLock<Option<Duration>>,
    fetch_calls: AtomicU64,
}

impl MemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    #[must_use]
    pub fn with_records(records: Vec<RawRecord>) -> Self {
        Self {
            records: RwLock::new(records),
            failure: RwLock::new(None),
            latency: RwLock::new(None),
            fetch_calls: AtomicU64::new(0),
        }
    }

    /// Replace the whole catalogue.
    pub fn set_records(&self, records: Vec<RawRecord>) {
        *self.records.write() = records;
    }

    pub fn push(&self, record: RawRecord) {
        self.records.write().push(record);
    }

    /// Make every subsequent call fail with `error` (None restores service).
    pub fn fail_with(&self, error: Option<NetworkError>) {
        *self.failure.write() = error;
    }

    /// Delay every subsequent call.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    /// Number of `fetch_all` calls seen so far.
    #[must_use]
    pub fn fetch_calls(&self) -> u64 {
        self.fetch_calls.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    async fn simulate(&self) -> Result<(), NetworkError> {
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        match self.failure.read().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteSource for MemorySource {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn connect(&self) -> Result<(), NetworkError> {
        self.simulate().await
    }

    async fn fetch_all(&self, filter: Option<&RecordFilter>) -> Result<Vec<RawRecord>, NetworkError> {
        self.fetch_calls.fetch_add(1, Ordering::AcqRel);
        self.simulate().await?;
        let records = self.records.read();
        Ok(records
            .iter()
            .filter(|r| RecordFilter::admits(filter, r))
            .cloned()
            .collect())
    }

    async fn fetch_statistics(&self) -> Result<SourceStatistics, NetworkError> {
        self.simulate().await?;
        Ok(SourceStatistics::from_records(self.records.read().iter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, product: &str) -> RawRecord {
        let mut r = RawRecord::new(id, format!("{id} happened"));
        r.product = product.to_string();
        r
    }

    #[tokio::test]
    async fn test_fetch_returns_active_only() {
        let mut inactive = record("c", "gateway");
        inactive.active = false;
        let source = MemorySource::with_records(vec![record("a", "gateway"), record("b", "auth"), inactive]);

        let all = source.fetch_all(None).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(source.fetch_calls(), 1);

        let stats = source.fetch_statistics().await.unwrap();
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.active_records, 2);
    }

    #[tokio::test]
    async fn test_filter_applies() {
        let source = MemorySource::with_records(vec![record("a", "gateway"), record("b", "auth")]);
        let filter = RecordFilter::default().product("auth");
        let records = source.fetch_all(Some(&filter)).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, "b");
    }

    #[tokio::test]
    async fn test_injected_failure_and_recovery() {
        let source = MemorySource::with_records(vec![record("a", "gateway")]);
        source.fail_with(Some(NetworkError::Refused("down".into())));
        assert_eq!(
            source.fetch_all(None).await.unwrap_err(),
            NetworkError::Refused("down".into())
        );
        assert!(source.connect().await.is_err());

        source.fail_with(None);
        assert_eq!(source.fetch_all(None).await.unwrap().len(), 1);
        assert_eq!(source.fetch_calls(), 2);
    }
}
