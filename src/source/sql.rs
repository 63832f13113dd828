// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed remote source.
//!
//! Pattern records live as JSON documents in a single collection table, with
//! the columns needed for server-side filtering pulled out:
//!
//! ```sql
//! CREATE TABLE log_patterns (
//!   id VARCHAR(255) PRIMARY KEY,
//!   product VARCHAR(255) NOT NULL DEFAULT '',
//!   active BIGINT NOT NULL DEFAULT 1,
//!   document LONGTEXT NOT NULL,   -- RawRecord as JSON
//!   updated_at BIGINT NOT NULL DEFAULT 0
//! )
//! ```
//!
//! ## sqlx Any Driver Quirks
//!
//! The `Any` driver hands MySQL LONGTEXT back as bytes, so `document` is read
//! as `String` first and `Vec<u8>` second.

use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyPool, Row};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::traits::{redact_url, NetworkError, RawRecord, RecordFilter, RemoteSource, SourceStatistics};
use crate::config::{is_identifier, ConfigError, PatternSyncConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub min_connections: u32,
    pub max_connections: u32,
    /// Upper bound on establishing the pool
    pub connect_timeout: Duration,
    /// Upper bound on waiting for a pooled connection
    pub acquire_timeout: Duration,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            connect_timeout: Duration::from_secs(10),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolSettings {
    #[must_use]
    pub fn from_config(config: &PatternSyncConfig) -> Self {
        Self {
            min_connections: config.pool_min_size,
            max_connections: config.pool_max_size,
            connect_timeout: config.connect_timeout(),
            acquire_timeout: config.selection_timeout(),
        }
    }
}

pub struct SqlSource {
    url: String,
    table: String,
    settings: PoolSettings,
    is_sqlite: bool,
    pool: OnceCell<AnyPool>,
}

impl SqlSource {
    /// Create a source over `table`. No connection is made until first use.
    pub fn new(url: &str, table: &str, settings: PoolSettings) -> Result<Self, ConfigError> {
        if !is_identifier(table) {
            return Err(ConfigError::InvalidValue {
                key: "collection".to_string(),
                reason: format!("'{table}' is not a valid table name"),
            });
        }
        Ok(Self {
            url: url.to_string(),
            table: table.to_string(),
            settings,
            is_sqlite: url.starts_with("sqlite:"),
            pool: OnceCell::new(),
        })
    }

    pub fn from_config(url: &str, config: &PatternSyncConfig) -> Result<Self, ConfigError> {
        Self::new(url, &config.collection, PoolSettings::from_config(config))
    }

    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    async fn pool(&self) -> Result<&AnyPool, NetworkError> {
        self.pool.get_or_try_init(|| self.open_pool()).await
    }

    async fn open_pool(&self) -> Result<AnyPool, NetworkError> {
        install_drivers();

        let connecting = AnyPoolOptions::new()
            .min_connections(self.settings.min_connections)
            .max_connections(self.settings.max_connections)
            .acquire_timeout(self.settings.acquire_timeout)
            .idle_timeout(Duration::from_secs(300))
            .connect(&self.url);

        let pool = tokio::time::timeout(self.settings.connect_timeout, connecting)
            .await
            .map_err(|_| {
                NetworkError::Timeout(format!(
                    "connecting to {} took longer than {:?}",
                    redact_url(&self.url),
                    self.settings.connect_timeout
                ))
            })?
            .map_err(map_sqlx_error)?;

        info!(
            url = %redact_url(&self.url),
            table = %self.table,
            max_connections = self.settings.max_connections,
            "SQL pattern source connected"
        );
        Ok(pool)
    }

    /// Create the collection table if it does not exist.
    pub async fn init_schema(&self) -> Result<(), NetworkError> {
        let sql = if self.is_sqlite {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id TEXT PRIMARY KEY,
                    product TEXT NOT NULL DEFAULT '',
                    active INTEGER NOT NULL DEFAULT 1,
                    document TEXT NOT NULL,
                    updated_at INTEGER NOT NULL DEFAULT 0
                )",
                self.table
            )
        } else {
            format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id VARCHAR(255) PRIMARY KEY,
                    product VARCHAR(255) NOT NULL DEFAULT '',
                    active BIGINT NOT NULL DEFAULT 1,
                    document LONGTEXT NOT NULL,
                    updated_at BIGINT NOT NULL DEFAULT 0,
                    INDEX idx_product (product),
                    INDEX idx_active (active)
                )",
                self.table
            )
        };

        sqlx::query(&sql)
            .execute(self.pool().await?)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Insert or replace a record document.
    pub async fn upsert_record(&self, record: &RawRecord) -> Result<(), NetworkError> {
        let document = serde_json::to_string(record)
            .map_err(|e| NetworkError::Protocol(format!("failed to encode record {}: {}", record.id, e)))?;
        let updated_at = record.updated_at.map_or(0, |t| t.timestamp_millis());

        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (id, product, active, document, updated_at) VALUES (?, ?, ?, ?, ?)
                 ON CONFLICT(id) DO UPDATE SET
                    product = excluded.product,
                    active = excluded.active,
                    document = excluded.document,
                    updated_at = excluded.updated_at",
                self.table
            )
        } else {
            format!(
                "INSERT INTO {} (id, product, active, document, updated_at) VALUES (?, ?, ?, ?, ?)
                 ON DUPLICATE KEY UPDATE
                    product = VALUES(product),
                    active = VALUES(active),
                    document = VALUES(document),
                    updated_at = VALUES(updated_at)",
                self.table
            )
        };

        sqlx::query(&sql)
            .bind(&record.id)
            .bind(&record.product)
            .bind(i64::from(record.active))
            .bind(&document)
            .bind(updated_at)
            .execute(self.pool().await?)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    pub async fn delete_record(&self, id: &str) -> Result<(), NetworkError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", self.table);
        sqlx::query(&sql)
            .bind(id)
            .execute(self.pool().await?)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Write a raw document verbatim (bypasses encoding; for repair and tests).
    pub async fn upsert_raw_document(&self, id: &str, document: &str) -> Result<(), NetworkError> {
        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO {} (id, document) VALUES (?, ?)
                 ON CONFLICT(id) DO UPDATE SET document = excluded.document",
                self.table
            )
        } else {
            format!(
                "INSERT INTO {} (id, document) VALUES (?, ?)
                 ON DUPLICATE KEY UPDATE document = VALUES(document)",
                self.table
            )
        };
        sqlx::query(&sql)
            .bind(id)
            .bind(document)
            .execute(self.pool().await?)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }
}

/// Decode one row's document. Malformed documents are skipped by callers.
fn decode_row(row: &sqlx::any::AnyRow) -> Result<RawRecord, String> {
    let id: String = row.try_get("id").map_err(|e| e.to_string())?;
    let document: String = row
        .try_get::<String, _>("document")
        .ok()
        .or_else(|| {
            row.try_get::<Vec<u8>, _>("document")
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        })
        .ok_or_else(|| format!("record {id}: document column unreadable"))?;

    let mut record: RawRecord =
        serde_json::from_str(&document).map_err(|e| format!("record {id}: {e}"))?;
    if record.id.is_empty() {
        record.id = id;
    }
    Ok(record)
}

#[async_trait]
impl RemoteSource for SqlSource {
    fn describe(&self) -> String {
        format!("{}#{}", redact_url(&self.url), self.table)
    }

    async fn connect(&self) -> Result<(), NetworkError> {
        let pool = self.pool().await?;
        sqlx::query("SELECT 1")
            .execute(pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    #[tracing::instrument(skip(self, filter), fields(table = %self.table))]
    async fn fetch_all(&self, filter: Option<&RecordFilter>) -> Result<Vec<RawRecord>, NetworkError> {
        let pool = self.pool().await?;
        let product = filter.and_then(|f| f.product.clone());
        let mut conditions = Vec::new();
        if !RecordFilter::wants_inactive(filter) {
            conditions.push("active = 1");
        }
        if product.is_some() {
            conditions.push("product = ?");
        }
        let mut sql = format!("SELECT id, active, document FROM {}", self.table);
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY id");

        let mut query = sqlx::query(&sql);
        if let Some(ref product) = product {
            query = query.bind(product.clone());
        }
        let rows = query.fetch_all(pool).await.map_err(map_sqlx_error)?;

        let mut records = Vec::with_capacity(rows.len());
        let mut skipped = 0usize;
        for row in &rows {
            match decode_row(row) {
                Ok(mut record) => {
                    // the column is authoritative over the document's flag
                    if let Ok(active) = row.try_get::<i64, _>("active") {
                        record.active = active != 0;
                    }
                    if RecordFilter::admits(filter, &record) {
                        records.push(record);
                    }
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "Skipping undecodable pattern document");
                }
            }
        }

        debug!(fetched = records.len(), skipped, "SQL fetch complete");
        Ok(records)
    }

    async fn fetch_statistics(&self) -> Result<SourceStatistics, NetworkError> {
        let pool = self.pool().await?;
        let sql = format!("SELECT id, product, active, document FROM {}", self.table);
        let rows = sqlx::query(&sql)
            .fetch_all(pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let active: i64 = row.try_get("active").unwrap_or(1);
            let mut record = decode_row(row).unwrap_or_else(|_| RawRecord {
                id: row.try_get("id").unwrap_or_default(),
                product: row.try_get("product").unwrap_or_default(),
                ..Default::default()
            });
            record.active = active != 0;
            records.push(record);
        }
        Ok(SourceStatistics::from_records(&records))
    }
}

/// Translate driver errors into the source error taxonomy.
fn map_sqlx_error(err: sqlx::Error) -> NetworkError {
    match err {
        sqlx::Error::PoolTimedOut => {
            NetworkError::Timeout("timed out waiting for a pooled connection".to_string())
        }
        sqlx::Error::PoolClosed => NetworkError::Refused("connection pool closed".to_string()),
        sqlx::Error::Io(e) => NetworkError::Refused(e.to_string()),
        sqlx::Error::Tls(e) => NetworkError::Refused(e.to_string()),
        sqlx::Error::Database(db) => {
            let code = db.code().map(|c| c.to_string()).unwrap_or_default();
            let message = db.message().to_string();
            if matches!(code.as_str(), "28000" | "28P01" | "1045" | "1044")
                || message.contains("Access denied")
            {
                NetworkError::Auth(message)
            } else {
                NetworkError::Protocol(message)
            }
        }
        other => NetworkError::Protocol(other.to_string()),
    }
}
