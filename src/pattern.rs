// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The internal matching representation of a log pattern.
//!
//! A [`Pattern`] owns a compiled [`Regex`] and is immutable once built. On
//! disk it travels as a [`PatternDocument`] (expression as text) and is
//! recompiled on load, so a cache file can never smuggle in an expression
//! that would not compile.

use std::collections::BTreeSet;
use std::fmt;

use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Diagnostic severity of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Hint,
}

impl Severity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Hint => "hint",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Named sub-expression used to pull a value out of a matched line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterExtractor {
    pub name: String,
    pub expression: String,
}

/// Serialized form of a [`Pattern`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternDocument {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub message: String,
    pub expression: String,
    pub severity: Severity,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub multiline: bool,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub capture_fields: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ParameterExtractor>,
    #[serde(default)]
    pub checksum: String,
}

impl PatternDocument {
    /// Feed every field into `hasher`, unit-separated so adjacent fields can't alias.
    pub(crate) fn digest_into(&self, hasher: &mut Sha256) {
        fn field(hasher: &mut Sha256, value: &str) {
            hasher.update(value.as_bytes());
            hasher.update([0x1f]);
        }

        field(hasher, &self.id);
        field(hasher, &self.name);
        field(hasher, &self.message);
        field(hasher, &self.expression);
        field(hasher, self.severity.as_str());
        for tag in &self.tags {
            field(hasher, tag);
        }
        hasher.update([0x1e]);
        field(hasher, self.action.as_deref().unwrap_or(""));
        field(hasher, if self.multiline { "1" } else { "0" });
        field(hasher, &self.product);
        for category in &self.categories {
            field(hasher, category);
        }
        hasher.update([0x1e]);
        for capture in &self.capture_fields {
            field(hasher, capture);
        }
        hasher.update([0x1e]);
        for param in &self.parameters {
            field(hasher, &param.name);
            field(hasher, &param.expression);
        }
        hasher.update([0x1e]);
        field(hasher, &self.checksum);
        hasher.update([0x1d]);
    }
}

/// A compiled log pattern.
///
/// Construct with [`Pattern::new`] and the `with_*` builders, or via the
/// converter. Shared between snapshots as `Arc<Pattern>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "PatternDocument", into = "PatternDocument")]
pub struct Pattern {
    pub id: String,
    pub name: String,
    /// Annotation text; `{{ FIELD }}` placeholders refer to capture fields / parameters
    pub message: String,
    pub matcher: Regex,
    pub severity: Severity,
    pub tags: BTreeSet<String>,
    /// Remediation / follow-up text
    pub action: Option<String>,
    pub multiline: bool,
    pub product: String,
    pub categories: Vec<String>,
    pub capture_fields: Vec<String>,
    pub parameters: Vec<ParameterExtractor>,
    /// Fingerprint of the record this pattern was built from
    pub checksum: String,
}

impl Pattern {
    /// Compile `expression` into a pattern with default metadata.
    pub fn new(id: impl Into<String>, expression: &str) -> Result<Self, regex::Error> {
        let id = id.into();
        let matcher = Regex::new(expression)?;
        let capture_fields = capture_names(&matcher);
        let checksum = fingerprint(&[&id, expression]);
        Ok(Self {
            name: id.clone(),
            id,
            message: String::new(),
            matcher,
            severity: Severity::Info,
            tags: BTreeSet::new(),
            action: None,
            multiline: false,
            product: String::new(),
            categories: Vec::new(),
            capture_fields,
            parameters: Vec::new(),
            checksum,
        })
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    #[must_use]
    pub fn with_product(mut self, product: impl Into<String>) -> Self {
        let product = product.into();
        if !product.is_empty() {
            self.tags.insert(product.clone());
        }
        self.product = product;
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        let category = category.into();
        if !category.is_empty() {
            self.tags.insert(category.clone());
            self.categories.push(category);
        }
        self
    }

    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        let tag = tag.into();
        if !tag.is_empty() {
            self.tags.insert(tag);
        }
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    #[must_use]
    pub fn with_multiline(mut self, multiline: bool) -> Self {
        self.multiline = multiline;
        self
    }

    /// The source text of the compiled expression.
    #[must_use]
    pub fn expression(&self) -> &str {
        self.matcher.as_str()
    }

    #[must_use]
    pub fn is_match(&self, line: &str) -> bool {
        self.matcher.is_match(line)
    }

    /// First category, if any.
    #[must_use]
    pub fn primary_category(&self) -> Option<&str> {
        self.categories.first().map(String::as_str)
    }

    #[must_use]
    pub fn has_category(&self, category: &str) -> bool {
        self.categories.iter().any(|c| c == category)
    }

    #[must_use]
    pub fn to_document(&self) -> PatternDocument {
        PatternDocument::from(self.clone())
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.message == other.message
            && self.matcher.as_str() == other.matcher.as_str()
            && self.severity == other.severity
            && self.tags == other.tags
            && self.action == other.action
            && self.multiline == other.multiline
            && self.product == other.product
            && self.categories == other.categories
            && self.capture_fields == other.capture_fields
            && self.parameters == other.parameters
            && self.checksum == other.checksum
    }
}

impl Eq for Pattern {}

impl TryFrom<PatternDocument> for Pattern {
    type Error = regex::Error;

    fn try_from(doc: PatternDocument) -> Result<Self, Self::Error> {
        let matcher = Regex::new(&doc.expression)?;
        Ok(Self {
            id: doc.id,
            name: doc.name,
            message: doc.message,
            matcher,
            severity: doc.severity,
            tags: doc.tags,
            action: doc.action,
            multiline: doc.multiline,
            product: doc.product,
            categories: doc.categories,
            capture_fields: doc.capture_fields,
            parameters: doc.parameters,
            checksum: doc.checksum,
        })
    }
}

impl From<Pattern> for PatternDocument {
    fn from(pattern: Pattern) -> Self {
        Self {
            expression: pattern.matcher.as_str().to_string(),
            id: pattern.id,
            name: pattern.name,
            message: pattern.message,
            severity: pattern.severity,
            tags: pattern.tags,
            action: pattern.action,
            multiline: pattern.multiline,
            product: pattern.product,
            categories: pattern.categories,
            capture_fields: pattern.capture_fields,
            parameters: pattern.parameters,
            checksum: pattern.checksum,
        }
    }
}

/// Named capture groups of a compiled expression, in declaration order.
pub(crate) fn capture_names(matcher: &Regex) -> Vec<String> {
    matcher.capture_names().flatten().map(str::to_string).collect()
}

/// SHA-256 over unit-separated parts, hex encoded.
pub(crate) fn fingerprint(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_extracts_capture_fields() {
        let p = Pattern::new("disk-full", r"No space left on device: (?P<path>\S+) \((?P<code>\d+)\)")
            .unwrap();
        assert_eq!(p.capture_fields, vec!["path", "code"]);
        assert_eq!(p.name, "disk-full");
        assert_eq!(p.checksum.len(), 64);
    }

    #[test]
    fn test_new_rejects_bad_expression() {
        assert!(Pattern::new("broken", "([unclosed").is_err());
    }

    #[test]
    fn test_builders_maintain_tags() {
        let p = Pattern::new("id", "x")
            .unwrap()
            .with_product("gateway")
            .with_category("network")
            .with_tag("tls")
            .with_tag("");
        let tags: Vec<_> = p.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, vec!["gateway", "network", "tls"]);
        assert_eq!(p.primary_category(), Some("network"));
        assert!(p.has_category("network"));
    }

    #[test]
    fn test_json_roundtrip_recompiles() {
        let p = Pattern::new("oom", r"(?i)out of memory")
            .unwrap()
            .with_severity(Severity::Error)
            .with_action("Raise the memory limit");
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains(r#""expression":"(?i)out of memory""#));
        let back: Pattern = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(back.is_match("OUT OF MEMORY"));
    }

    #[test]
    fn test_deserialize_invalid_expression_fails() {
        let json = r#"{"id":"x","expression":"(","severity":"error"}"#;
        assert!(serde_json::from_str::<Pattern>(json).is_err());
    }

    #[test]
    fn test_digest_changes_with_content() {
        let a = Pattern::new("a", "x").unwrap().to_document();
        let mut b = a.clone();
        b.action = Some("restart".into());

        let digest = |doc: &PatternDocument| {
            let mut h = Sha256::new();
            doc.digest_into(&mut h);
            hex::encode(h.finalize())
        };
        assert_ne!(digest(&a), digest(&b));
        assert_eq!(digest(&a), digest(&a.clone()));
    }

    #[test]
    fn test_severity_serde_lowercase() {
        assert_eq!(serde_json::to_string(&Severity::Warning).unwrap(), r#""warning""#);
        assert_eq!(Severity::Hint.to_string(), "hint");
    }
}
