// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Built-in last-resort pattern set.
//!
//! Served only when neither the remote source nor any cache can be used, so
//! the matcher always has something generic to work with.

use chrono::{DateTime, Utc};
use tracing::error;

use crate::pattern::{Pattern, Severity};
use crate::snapshot::Snapshot;

/// Product tag carried by every built-in pattern.
pub const BUILTIN_PRODUCT: &str = "builtin";

struct Builtin {
    id: &'static str,
    name: &'static str,
    expression: &'static str,
    severity: Severity,
    category: &'static str,
    action: &'static str,
}

const BUILTINS: &[Builtin] = &[
    Builtin {
        id: "builtin-out-of-memory",
        name: "Out of memory",
        expression: r"(?i)\b(out of memory|OutOfMemoryError|cannot allocate memory|oom-killer)\b",
        severity: Severity::Error,
        category: "resources",
        action: "Check memory limits and look for leaks in the reporting process.",
    },
    Builtin {
        id: "builtin-disk-full",
        name: "Disk full",
        expression: r"(?i)\b(no space left on device|disk (is )?full|quota exceeded)\b",
        severity: Severity::Error,
        category: "resources",
        action: "Free space on the affected volume or extend it.",
    },
    Builtin {
        id: "builtin-connection-refused",
        name: "Connection refused",
        expression: r"(?i)\bconnection refused\b(?:.*?(?P<endpoint>[\w.-]+:\d+))?",
        severity: Severity::Error,
        category: "network",
        action: "Verify the target service is running and reachable.",
    },
    Builtin {
        id: "builtin-timeout",
        name: "Operation timed out",
        expression: r"(?i)\b(timed out|timeout (expired|exceeded)|deadline exceeded)\b",
        severity: Severity::Warning,
        category: "network",
        action: "Check latency to the remote end and the configured timeouts.",
    },
    Builtin {
        id: "builtin-permission-denied",
        name: "Permission denied",
        expression: r"(?i)\b(permission denied|access denied|EACCES|operation not permitted)\b",
        severity: Severity::Error,
        category: "security",
        action: "Check file ownership, ACLs and the account the service runs as.",
    },
    Builtin {
        id: "builtin-crash-trace",
        name: "Crash or stack trace",
        expression: r"(?m)^\s*(Traceback \(most recent call last\)|panicked at|Exception in thread|at [\w$.]+\([\w.]+:\d+\))",
        severity: Severity::Error,
        category: "crash",
        action: "Inspect the surrounding stack trace for the failing component.",
    },
];

/// Build the built-in snapshot stamped at `now`.
///
/// Expressions are constants; one failing to compile is a programming error,
/// logged and dropped rather than aborting the fallback.
#[must_use]
pub fn default_snapshot(ttl_seconds: u64, now: DateTime<Utc>) -> Snapshot {
    let patterns = BUILTINS.iter().filter_map(|b| {
        match Pattern::new(b.id, b.expression) {
            Ok(p) => Some(
                p.with_name(b.name)
                    .with_message(b.name)
                    .with_severity(b.severity)
                    .with_product(BUILTIN_PRODUCT)
                    .with_category(b.category)
                    .with_action(b.action)
                    .with_multiline(b.expression.starts_with("(?m)")),
            ),
            Err(e) => {
                error!(id = b.id, error = %e, "Built-in pattern failed to compile");
                None
            }
        }
    });
    Snapshot::build(patterns, ttl_seconds, now)
}
