// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed remote source.
//!
//! Each record is a JSON string under a namespaced key:
//!
//! ```text
//! {database}:{collection}:{id}  →  {"id": "...", "expression": "...", ...}
//! ```
//!
//! Fetches enumerate keys with `SCAN MATCH` and read them back with
//! chunked `MGET`. Activity and filters are evaluated client-side.
//!
//! All commands share one multiplexed [`ConnectionManager`], so there is no
//! pool to size: `pool_min_size` has no effect here. `pool_max_size` caps
//! the operations in flight at once, and an operation that cannot get a slot
//! within `selection_timeout_secs` fails with [`NetworkError::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client, ErrorKind, RedisError};
use tokio::sync::{OnceCell, Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

use super::traits::{redact_url, NetworkError, RawRecord, RecordFilter, RemoteSource, SourceStatistics};
use crate::config::PatternSyncConfig;

const SCAN_COUNT: usize = 500;
const MGET_CHUNK: usize = 500;

const DEFAULT_MAX_IN_FLIGHT: usize = 10;
const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct RedisSource {
    url: String,
    /// "{database}:{collection}:"
    prefix: String,
    connect_timeout: Duration,
    connection: OnceCell<ConnectionManager>,
    /// Bounds concurrent operations on the shared connection
    slots: Semaphore,
    slot_timeout: Duration,
}

impl RedisSource {
    /// Create a source; the connection is established on first use.
    #[must_use]
    pub fn new(url: &str, database: &str, collection: &str, connect_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            prefix: format!("{database}:{collection}:"),
            connect_timeout,
            connection: OnceCell::new(),
            slots: Semaphore::new(DEFAULT_MAX_IN_FLIGHT),
            slot_timeout: DEFAULT_SLOT_TIMEOUT,
        }
    }

    /// Allow at most `max_in_flight` concurrent operations, each waiting up to
    /// `slot_timeout` for its turn.
    #[must_use]
    pub fn with_concurrency(mut self, max_in_flight: usize, slot_timeout: Duration) -> Self {
        self.slots = Semaphore::new(max_in_flight.max(1));
        self.slot_timeout = slot_timeout;
        self
    }

    #[must_use]
    pub fn from_config(url: &str, config: &PatternSyncConfig) -> Self {
        let max_in_flight = usize::try_from(config.pool_max_size).unwrap_or(usize::MAX);
        Self::new(url, &config.database, &config.collection, config.connect_timeout())
            .with_concurrency(max_in_flight, config.selection_timeout())
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[inline]
    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Wait for an operation slot, bounded by the slot timeout.
    async fn slot(&self) -> Result<SemaphorePermit<'_>, NetworkError> {
        match tokio::time::timeout(self.slot_timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(NetworkError::Refused("redis source closed".to_string())),
            Err(_) => Err(NetworkError::Timeout(format!(
                "no free redis slot on {} within {:?}",
                redact_url(&self.url),
                self.slot_timeout
            ))),
        }
    }

    async fn connection(&self) -> Result<ConnectionManager, NetworkError> {
        let conn = self
            .connection
            .get_or_try_init(|| async {
                let client = Client::open(self.url.as_str()).map_err(map_redis_error)?;
                let conn = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(client))
                    .await
                    .map_err(|_| {
                        NetworkError::Timeout(format!(
                            "connecting to {} took longer than {:?}",
                            redact_url(&self.url),
                            self.connect_timeout
                        ))
                    })?
                    .map_err(map_redis_error)?;
                info!(url = %redact_url(&self.url), prefix = %self.prefix, "Redis pattern source connected");
                Ok::<_, NetworkError>(conn)
            })
            .await?;
        Ok(conn.clone())
    }

    /// Store a record as JSON under its namespaced key.
    pub async fn upsert_record(&self, record: &RawRecord) -> Result<(), NetworkError> {
        let json = serde_json::to_string(record)
            .map_err(|e| NetworkError::Protocol(format!("failed to encode record {}: {}", record.id, e)))?;
        let _slot = self.slot().await?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(self.key(&record.id), json)
            .await
            .map_err(map_redis_error)
    }

    pub async fn delete_record(&self, id: &str) -> Result<(), NetworkError> {
        let _slot = self.slot().await?;
        let mut conn = self.connection().await?;
        conn.del::<_, ()>(self.key(id)).await.map_err(map_redis_error)
    }

    /// Write a raw value verbatim (bypasses encoding; for repair and tests).
    pub async fn upsert_raw_document(&self, id: &str, document: &str) -> Result<(), NetworkError> {
        let _slot = self.slot().await?;
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(self.key(id), document)
            .await
            .map_err(map_redis_error)
    }

    async fn scan_keys(&self, conn: &mut ConnectionManager) -> Result<Vec<String>, NetworkError> {
        let pattern = format!("{}*", self.prefix);
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT)
                .query_async(conn)
                .await
                .map_err(map_redis_error)?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Every record under the prefix, including inactive ones, in key order.
    async fn load_all(&self) -> Result<Vec<RawRecord>, NetworkError> {
        let _slot = self.slot().await?;
        let mut conn = self.connection().await?;
        let keys = self.scan_keys(&mut conn).await?;

        let mut records = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(MGET_CHUNK) {
            let values: Vec<Option<String>> = cmd("MGET")
                .arg(chunk)
                .query_async(&mut conn)
                .await
                .map_err(map_redis_error)?;

            for (key, value) in chunk.iter().zip(values) {
                // deleted between SCAN and MGET
                let Some(json) = value else { continue };
                match serde_json::from_str::<RawRecord>(&json) {
                    Ok(mut record) => {
                        if record.id.is_empty() {
                            record.id = key.strip_prefix(&self.prefix).unwrap_or(key).to_string();
                        }
                        records.push(record);
                    }
                    Err(e) => warn!(key = %key, error = %e, "Skipping undecodable pattern document"),
                }
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl RemoteSource for RedisSource {
    fn describe(&self) -> String {
        format!("{}#{}", redact_url(&self.url), self.prefix)
    }

    async fn connect(&self) -> Result<(), NetworkError> {
        let _slot = self.slot().await?;
        let mut conn = self.connection().await?;
        let _: String = cmd("PING").query_async(&mut conn).await.map_err(map_redis_error)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, filter), fields(prefix = %self.prefix))]
    async fn fetch_all(&self, filter: Option<&RecordFilter>) -> Result<Vec<RawRecord>, NetworkError> {
        let records: Vec<RawRecord> = self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| RecordFilter::admits(filter, r))
            .collect();
        debug!(fetched = records.len(), "Redis fetch complete");
        Ok(records)
    }

    async fn fetch_statistics(&self) -> Result<SourceStatistics, NetworkError> {
        let records = self.load_all().await?;
        Ok(SourceStatistics::from_records(&records))
    }
}

fn map_redis_error(err: RedisError) -> NetworkError {
    if err.is_timeout() {
        return NetworkError::Timeout(err.to_string());
    }
    if err.is_connection_refusal() || err.is_connection_dropped() {
        return NetworkError::Refused(err.to_string());
    }
    match err.kind() {
        ErrorKind::AuthenticationFailed => NetworkError::Auth(err.to_string()),
        ErrorKind::IoError => NetworkError::Refused(err.to_string()),
        _ => NetworkError::Protocol(err.to_string()),
    }
}
