// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Raw record → [`Pattern`] conversion.
//!
//! Conversion is pure and per-record: a bad record yields a
//! [`ConversionError`] and the batch carries on.
//!
//! # Severity table
//!
//! ```text
//! error | critical | fatal | severe      → Error
//! warning | warn | caution              → Warning
//! info | information | notice           → Info
//! hint | debug | trace | verbose        → Hint
//! anything else                         → Info (logged)
//! ```
//!
//! Configured overrides are consulted before the table.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pattern::{capture_names, fingerprint, ParameterExtractor, Pattern, Severity};
use crate::source::RawRecord;

const NAME_MAX_CHARS: usize = 50;
const MESSAGE_SAMPLE_CHARS: usize = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConversionError {
    #[error("record '{id}': invalid match expression: {reason}")]
    InvalidExpression { id: String, reason: String },
    #[error("record '{id}': missing required field '{field}'")]
    MissingField { id: String, field: &'static str },
    #[error("record '{id}': skipped ({reason})")]
    Skipped { id: String, reason: &'static str },
}

impl ConversionError {
    #[must_use]
    pub fn record_id(&self) -> &str {
        match self {
            Self::InvalidExpression { id, .. } | Self::MissingField { id, .. } | Self::Skipped { id, .. } => id,
        }
    }

    /// Deliberate exclusions, as opposed to bad data.
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConverterConfig {
    /// Honour multi-line expressions (otherwise every pattern is single-line)
    #[serde(default = "default_true")]
    pub convert_multiline: bool,
    /// Convert records flagged inactive
    #[serde(default)]
    pub include_inactive: bool,
    /// Convert content annotations
    #[serde(default)]
    pub include_content: bool,
    /// Severity text (case-insensitive) → severity, checked before the built-in table
    #[serde(default)]
    pub severity_overrides: HashMap<String, Severity>,
}

fn default_true() -> bool { true }

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            convert_multiline: true,
            include_inactive: false,
            include_content: false,
            severity_overrides: HashMap::new(),
        }
    }
}

/// Outcome of converting a batch.
#[derive(Debug, Clone, Default)]
pub struct ConversionResult {
    pub patterns: Vec<Pattern>,
    pub errors: Vec<ConversionError>,
    pub total: usize,
}

impl ConversionResult {
    /// Records rejected for bad data (skips excluded).
    #[must_use]
    pub fn failed(&self) -> usize {
        self.errors.iter().filter(|e| !e.is_skip()).count()
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.errors.iter().filter(|e| e.is_skip()).count()
    }

    /// Converted / total, in 0.0..=1.0 (0.0 for an empty batch).
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.patterns.len() as f64 / self.total as f64
        }
    }

    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "Converted {}/{} patterns ({:.1}% success rate, {} failed, {} skipped)",
            self.patterns.len(),
            self.total,
            self.success_rate() * 100.0,
            self.failed(),
            self.skipped()
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternConverter {
    config: ConverterConfig,
}

impl PatternConverter {
    #[must_use]
    pub fn new(config: ConverterConfig) -> Self {
        let severity_overrides = config
            .severity_overrides
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_lowercase(), v))
            .collect();
        Self {
            config: ConverterConfig {
                severity_overrides,
                ..config
            },
        }
    }

    #[must_use]
    pub fn config(&self) -> &ConverterConfig {
        &self.config
    }

    /// Map free-text severity onto the four-level scale.
    #[must_use]
    pub fn map_severity(&self, raw: &str) -> Severity {
        let key = raw.trim().to_ascii_lowercase();
        if let Some(severity) = self.config.severity_overrides.get(&key) {
            return *severity;
        }
        match key.as_str() {
            "error" | "critical" | "fatal" | "severe" => Severity::Error,
            "warning" | "warn" | "caution" => Severity::Warning,
            "info" | "information" | "notice" => Severity::Info,
            "hint" | "debug" | "trace" | "verbose" => Severity::Hint,
            _ => {
                warn!(severity = %raw, "Unknown severity, defaulting to info");
                Severity::Info
            }
        }
    }

    /// Convert one record. Pure apart from logging.
    pub fn convert(&self, record: &RawRecord) -> Result<Pattern, ConversionError> {
        let id = record.id.trim();
        if id.is_empty() {
            return Err(ConversionError::MissingField {
                id: String::new(),
                field: "id",
            });
        }
        if !record.active && !self.config.include_inactive {
            return Err(ConversionError::Skipped {
                id: id.to_string(),
                reason: "inactive",
            });
        }
        if record.content && !self.config.include_content {
            return Err(ConversionError::Skipped {
                id: id.to_string(),
                reason: "content annotation",
            });
        }

        let expression = record.expression.trim();
        if expression.is_empty() {
            return Err(ConversionError::MissingField {
                id: id.to_string(),
                field: "expression",
            });
        }

        let matcher = Regex::new(expression).map_err(|e| ConversionError::InvalidExpression {
            id: id.to_string(),
            reason: e.to_string(),
        })?;

        let multiline = self.config.convert_multiline
            && record.multiline.unwrap_or_else(|| looks_multiline(expression));

        let name = build_name(record, id, expression);
        let message = build_message(record, &name);

        let mut tags = std::collections::BTreeSet::new();
        if !record.product.trim().is_empty() {
            tags.insert(record.product.trim().to_string());
        }
        for value in record.category.iter().chain(record.tags.iter()) {
            let value = value.trim();
            if !value.is_empty() {
                tags.insert(value.to_string());
            }
        }

        let categories: Vec<String> = record
            .category
            .iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();

        let parameters = record
            .parameters
            .iter()
            .filter(|p| !p.name.trim().is_empty() && !p.expression.trim().is_empty())
            .map(|p| ParameterExtractor {
                name: p.name.trim().to_string(),
                expression: p.expression.trim().to_string(),
            })
            .collect();

        let checksum = fingerprint(&[
            id,
            expression,
            &record.severity,
            &record.product,
            &record.category.join("\u{1e}"),
            &record.tags.join("\u{1e}"),
            &record.template,
            &record.documentation,
            &record.references.kb_ids.join("\u{1e}"),
            &record.references.bug_ids.join("\u{1e}"),
            record.version.fixed.as_deref().unwrap_or(""),
        ]);

        Ok(Pattern {
            id: id.to_string(),
            name,
            message,
            capture_fields: capture_names(&matcher),
            matcher,
            severity: self.map_severity(&record.severity),
            tags,
            action: build_action(record),
            multiline,
            product: record.product.trim().to_string(),
            categories,
            parameters,
            checksum,
        })
    }

    /// Convert every record; one failure never aborts the batch.
    pub fn convert_batch(&self, records: &[RawRecord]) -> ConversionResult {
        let mut result = ConversionResult {
            patterns: Vec::with_capacity(records.len()),
            errors: Vec::new(),
            total: records.len(),
        };

        for record in records {
            match self.convert(record) {
                Ok(pattern) => result.patterns.push(pattern),
                Err(e) => {
                    if e.is_skip() {
                        debug!(error = %e, "Record skipped");
                    } else {
                        warn!(error = %e, "Record rejected");
                    }
                    result.errors.push(e);
                }
            }
        }

        crate::metrics::record_conversion(result.patterns.len(), result.failed(), result.skipped());
        info!(
            converted = result.patterns.len(),
            failed = result.failed(),
            skipped = result.skipped(),
            total = result.total,
            "{}",
            result.summary()
        );
        result
    }
}

/// Expressions spanning lines: literal newline escapes or dot-all / multi-line flags.
fn looks_multiline(expression: &str) -> bool {
    expression.contains("\\n") || expression.contains('\n') || expression.contains("(?s)") || expression.contains("(?m)")
}

fn truncate_chars(text: &str, max: usize) -> String {
    let mut out: String = text.chars().take(max).collect();
    if text.chars().count() > max {
        out.push_str("...");
    }
    out
}

/// Name from the example line (skipping timestamp / level tokens), the
/// template, or the expression, in that order.
fn build_name(record: &RawRecord, id: &str, expression: &str) -> String {
    let raw = record.raw_data.trim();
    if !raw.is_empty() {
        let parts: Vec<&str> = raw.split_whitespace().collect();
        let interesting = if parts.len() > 3 {
            parts[3..].iter().take(5).copied().collect::<Vec<_>>().join(" ")
        } else {
            raw.to_string()
        };
        return truncate_chars(&interesting, NAME_MAX_CHARS);
    }
    if !record.template.trim().is_empty() {
        return truncate_chars(&normalize_template(record.template.trim()), NAME_MAX_CHARS);
    }
    if !expression.is_empty() {
        return truncate_chars(expression, NAME_MAX_CHARS);
    }
    format!("Pattern {id}")
}

fn build_message(record: &RawRecord, name: &str) -> String {
    if !record.template.trim().is_empty() {
        normalize_template(record.template.trim())
    } else if !record.raw_data.trim().is_empty() {
        format!("Pattern matching: {}", truncate_chars(record.raw_data.trim(), MESSAGE_SAMPLE_CHARS))
    } else {
        name.to_string()
    }
}

/// Documentation, references and fix version, one per line.
fn build_action(record: &RawRecord) -> Option<String> {
    let mut lines = Vec::new();
    if !record.documentation.trim().is_empty() {
        lines.push(record.documentation.trim().to_string());
    }
    if !record.references.kb_ids.is_empty() {
        lines.push(format!("See KB: {}", record.references.kb_ids.join(", ")));
    }
    if !record.references.bug_ids.is_empty() {
        lines.push(format!("Related bugs: {}", record.references.bug_ids.join(", ")));
    }
    if let Some(ref fixed) = record.version.fixed {
        if !fixed.trim().is_empty() {
            lines.push(format!("Fixed in: {}", fixed.trim()));
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Rewrite `{{FIELD}}` / `{{  FIELD }}` placeholders to the canonical `{{ FIELD }}`.
pub fn normalize_template(template: &str) -> String {
    static PLACEHOLDER: OnceLock<Option<Regex>> = OnceLock::new();
    let placeholder = PLACEHOLDER.get_or_init(|| Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").ok());
    match placeholder {
        Some(re) => re.replace_all(template, "{{ $1 }}").into_owned(),
        None => template.to_string(),
    }
}
