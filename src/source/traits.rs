// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Remote timed out: {0}")]
    Timeout(String),
    #[error("Remote refused connection: {0}")]
    Refused(String),
    #[error("Remote authentication failed: {0}")]
    Auth(String),
    #[error("Remote protocol error: {0}")]
    Protocol(String),
}

impl NetworkError {
    /// Short label for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Refused(_) => "refused",
            Self::Auth(_) => "auth",
            Self::Protocol(_) => "protocol",
        }
    }
}

/// Knowledge-base and bug-tracker references attached to a record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalReferences {
    #[serde(default)]
    pub kb_ids: Vec<String>,
    #[serde(default)]
    pub bug_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub introduced: Option<String>,
    #[serde(default)]
    pub fixed: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawParameter {
    pub name: String,
    #[serde(alias = "regex")]
    pub expression: String,
}

/// A pattern definition as stored remotely. Unvalidated.
///
/// Every field is defaulted so a record with missing fields still reaches
/// the converter, which reports exactly what is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    #[serde(default, alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub category: Vec<String>,
    /// Free text, mapped by the converter's severity table
    #[serde(default)]
    pub severity: String,
    #[serde(default, alias = "regex")]
    pub expression: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub references: ExternalReferences,
    #[serde(default)]
    pub version: VersionInfo,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Display template with `{{ FIELD }}` placeholders
    #[serde(default)]
    pub template: String,
    #[serde(default)]
    pub documentation: String,
    #[serde(default)]
    pub multiline: Option<bool>,
    /// Content annotations describe whole files rather than lines
    #[serde(default)]
    pub content: bool,
    #[serde(default)]
    pub parameters: Vec<RawParameter>,
    /// Example log line the expression was written against
    #[serde(default)]
    pub raw_data: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

fn default_active() -> bool { true }

impl RawRecord {
    /// Minimal active record, mostly for seeding and tests.
    pub fn new(id: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            expression: expression.into(),
            severity: "info".to_string(),
            active: true,
            ..Default::default()
        }
    }
}

/// Server-side restriction on which records a fetch returns.
///
/// All set fields must match. Severity compares case-insensitively.
/// Inactive records are excluded unless `include_inactive` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFilter {
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default)]
    pub product: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub tag: Option<String>,
}

impl RecordFilter {
    #[must_use]
    pub fn include_inactive(mut self, include: bool) -> Self {
        self.include_inactive = include;
        self
    }

    /// Whether `record` passes an optional filter. No filter admits active records only.
    #[must_use]
    pub fn admits(filter: Option<&Self>, record: &RawRecord) -> bool {
        match filter {
            Some(filter) => filter.matches(record),
            None => record.active,
        }
    }

    /// Whether inactive records pass an optional filter.
    #[must_use]
    pub fn wants_inactive(filter: Option<&Self>) -> bool {
        filter.map_or(false, |f| f.include_inactive)
    }

    #[must_use]
    pub fn product(mut self, product: impl Into<String>) -> Self {
        self.product = Some(product.into());
        self
    }

    #[must_use]
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    #[must_use]
    pub fn severity(mut self, severity: impl Into<String>) -> Self {
        self.severity = Some(severity.into());
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    #[must_use]
    pub fn matches(&self, record: &RawRecord) -> bool {
        if !record.active && !self.include_inactive {
            return false;
        }
        if let Some(ref product) = self.product {
            if &record.product != product {
                return false;
            }
        }
        if let Some(ref category) = self.category {
            if !record.category.iter().any(|c| c == category) {
                return false;
            }
        }
        if let Some(ref severity) = self.severity {
            if !record.severity.trim().eq_ignore_ascii_case(severity.trim()) {
                return false;
            }
        }
        if let Some(ref tag) = self.tag {
            if !record.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

/// Aggregate counts describing the remote collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatistics {
    pub total_records: u64,
    pub active_records: u64,
    pub products: Vec<String>,
    pub categories: Vec<String>,
}

impl SourceStatistics {
    /// Derive statistics from a full (unfiltered, including inactive) record listing.
    #[must_use]
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a RawRecord>) -> Self {
        let mut total = 0u64;
        let mut active = 0u64;
        let mut products = BTreeSet::new();
        let mut categories = BTreeSet::new();
        for record in records {
            total += 1;
            if record.active {
                active += 1;
            }
            if !record.product.is_empty() {
                products.insert(record.product.clone());
            }
            categories.extend(record.category.iter().filter(|c| !c.is_empty()).cloned());
        }
        Self {
            total_records: total,
            active_records: active,
            products: products.into_iter().collect(),
            categories: categories.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn unique_products(&self) -> usize {
        self.products.len()
    }

    #[must_use]
    pub fn unique_categories(&self) -> usize {
        self.categories.len()
    }
}

/// A networked document store holding raw pattern records.
///
/// Implementations fail fast: no internal retry. Deciding what to do on
/// failure is the orchestrator's job.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Human-readable location with credentials stripped, for logs.
    fn describe(&self) -> String;

    /// Establish the pooled connection. Fetches connect lazily if this was skipped.
    async fn connect(&self) -> Result<(), NetworkError>;

    /// Records admitted by `filter` (active only when `None`), in a stable order.
    async fn fetch_all(&self, filter: Option<&RecordFilter>) -> Result<Vec<RawRecord>, NetworkError>;

    async fn fetch_statistics(&self) -> Result<SourceStatistics, NetworkError>;
}

/// Replace the password component of a URL, if any.
pub(crate) fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let authority_end = rest.find('/').unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    match authority.rfind('@') {
        Some(at) => {
            let userinfo = &authority[..at];
            let user = userinfo.split(':').next().unwrap_or("");
            format!(
                "{}://{}:***@{}",
                &url[..scheme_end],
                user,
                &rest[at + 1..]
            )
        }
        None => url.to_string(),
    }
}
