// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for pattern-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `pattern_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: remote, cache, converter, orchestrator
//! - `operation`: fetch, load, save, resolve, ...
//! - `status`: success, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "pattern_sync_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

// ═══════════════════════════════════════════════════════════════════════════
// RESOLUTION - Where the served snapshot came from
// ═══════════════════════════════════════════════════════════════════════════

/// Record a completed resolution
pub fn record_resolution(mode: &str, source: &str, degraded: bool) {
    counter!(
        "pattern_sync_resolutions_total",
        "mode" => mode.to_string(),
        "source" => source.to_string(),
        "degraded" => if degraded { "true" } else { "false" }
    )
    .increment(1);
}

/// Record a resolution that exhausted its fallback chain
pub fn record_resolution_failure(mode: &str, error_type: &str) {
    counter!(
        "pattern_sync_resolution_failures_total",
        "mode" => mode.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Record a fallback step being taken after `from` failed
pub fn record_fallback(from: &str, reason: &str) {
    counter!(
        "pattern_sync_fallbacks_total",
        "from" => from.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// REMOTE - Fetch outcomes and latency
// ═══════════════════════════════════════════════════════════════════════════

/// Record a remote fetch outcome ("success" or the error kind)
pub fn record_remote_fetch(status: &str, records: usize) {
    counter!(
        "pattern_sync_remote_fetches_total",
        "status" => status.to_string()
    )
    .increment(1);
    if records > 0 {
        histogram!("pattern_sync_remote_records").record(records as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// CONVERSION
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of a conversion batch
pub fn record_conversion(converted: usize, failed: usize, skipped: usize) {
    counter!("pattern_sync_conversions_total", "status" => "success").increment(converted as u64);
    counter!("pattern_sync_conversions_total", "status" => "error").increment(failed as u64);
    counter!("pattern_sync_conversions_total", "status" => "skipped").increment(skipped as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHE - Disk cache operations
// ═══════════════════════════════════════════════════════════════════════════

/// Record a disk cache operation
pub fn record_cache_operation(operation: &str, status: &str) {
    counter!(
        "pattern_sync_cache_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// PUBLISH - Hot swaps and the live snapshot
// ═══════════════════════════════════════════════════════════════════════════

/// Record a published snapshot swap
pub fn record_publish(source: &str) {
    counter!(
        "pattern_sync_publishes_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a candidate that was not newer than the live snapshot
pub fn record_publish_rejected() {
    counter!("pattern_sync_publish_rejected_total").increment(1);
}

/// Set the live snapshot's pattern count
pub fn set_published_patterns(count: usize) {
    gauge!("pattern_sync_published_patterns").set(count as f64);
}

/// Set whether the live snapshot is degraded (1 = degraded)
pub fn set_degraded(degraded: bool) {
    gauge!("pattern_sync_degraded").set(if degraded { 1.0 } else { 0.0 });
}

/// Set the live snapshot's age in seconds
pub fn set_snapshot_age(seconds: i64) {
    gauge!("pattern_sync_snapshot_age_seconds").set(seconds as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKGROUND REFRESH
// ═══════════════════════════════════════════════════════════════════════════

/// Record a background refresh tick outcome ("published", "unchanged", "error", "skipped", "cancelled")
pub fn record_refresh_tick(outcome: &str) {
    counter!(
        "pattern_sync_refresh_ticks_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(component: &str, operation: &str, error_type: &str) {
    counter!(
        "pattern_sync_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// LIFECYCLE
// ═══════════════════════════════════════════════════════════════════════════

/// Record lifecycle phase duration
pub fn record_lifecycle_phase(phase: &str, duration: Duration) {
    histogram!(
        "pattern_sync_lifecycle_seconds",
        "phase" => phase.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set orchestrator state (for monitoring state machine transitions)
pub fn set_orchestrator_state(state: &str) {
    counter!(
        "pattern_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}

/// Convenience macro for timing operations
#[macro_export]
macro_rules! time_operation {
    ($component:expr, $op:expr) => {
        $crate::metrics::LatencyTimer::new($component, $op)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    // These only prove the API doesn't panic without a recorder installed.
    // The demo installs metrics-util's DebuggingRecorder for real values.

    #[test]
    fn test_resolution_metrics() {
        record_resolution("cache-first", "cache", false);
        record_resolution("online-first", "default", true);
        record_resolution_failure("always-online", "timeout");
        record_fallback("remote", "refused");
    }

    #[test]
    fn test_remote_and_conversion_metrics() {
        record_remote_fetch("success", 120);
        record_remote_fetch("timeout", 0);
        record_conversion(99, 1, 0);
    }

    #[test]
    fn test_cache_and_publish_metrics() {
        record_cache_operation("save", "success");
        record_cache_operation("load", "corrupt");
        record_publish("remote");
        record_publish_rejected();
        set_published_patterns(42);
        set_degraded(true);
        set_snapshot_age(300);
    }

    #[test]
    fn test_refresh_and_lifecycle_metrics() {
        record_refresh_tick("published");
        record_refresh_tick("skipped");
        record_lifecycle_phase("initial_resolve", Duration::from_millis(12));
        set_orchestrator_state("Ready");
        record_error("cache", "save", "permission_denied");
    }

    #[test]
    fn test_latency_timer() {
        {
            let _timer = LatencyTimer::new("cache", "load");
            std::thread::sleep(Duration::from_micros(10));
        }
        // Timer recorded on drop
    }
}
