// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pattern refresh walkthrough.
//!
//! Demonstrates:
//! 1. Initial sync from an in-memory pattern store
//! 2. Querying the published snapshot through a consumer view
//! 3. Hot-reloading a changed catalogue with `force_refresh`
//! 4. Falling back to the disk cache when the remote goes away
//! 5. Background refresh and clean shutdown
//! 6. Displaying the recorded metrics
//!
//! No external services are needed; the cache lives in a temp directory.
//!
//! # Run
//!
//! ```bash
//! RUST_LOG=pattern_sync=debug cargo run --example refresh_patterns
//! ```

use std::sync::Arc;
use std::time::Duration;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use pattern_sync::source::MemorySource;
use pattern_sync::{NetworkError, PatternSyncConfig, RawRecord, RemoteSource, SyncMode, SyncOrchestrator};
use tracing_subscriber::EnvFilter;

fn record(id: &str, product: &str, category: &str, severity: &str, expression: &str) -> RawRecord {
    RawRecord {
        product: product.to_string(),
        category: vec![category.to_string()],
        severity: severity.to_string(),
        ..RawRecord::new(id, expression)
    }
}

fn catalogue() -> Vec<RawRecord> {
    vec![
        record("nginx-upstream", "nginx", "network", "error", r"upstream timed out \((?P<errno>\d+)"),
        record("pg-deadlock", "postgres", "database", "error", r"deadlock detected"),
        record("jvm-oom", "java", "resources", "critical", r"java\.lang\.OutOfMemoryError"),
        record("broken", "demo", "misc", "warn", r"(unclosed"),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pattern_sync=info")))
        .with_target(false)
        .compact()
        .init();

    println!("\n=== pattern-sync: refresh walkthrough ===\n");

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Configure and initialize
    // ─────────────────────────────────────────────────────────────────────────
    let cache_dir = tempfile::tempdir()?;
    let source = Arc::new(MemorySource::with_records(catalogue()));

    let config = PatternSyncConfig {
        cache_dir: cache_dir.path().to_path_buf(),
        sync_mode: SyncMode::OnlineFirst,
        auto_refresh_interval_secs: Some(1),
        query_timeout_secs: 2,
        ..Default::default()
    };

    let orchestrator = Arc::new(
        SyncOrchestrator::new(config, Some(source.clone() as Arc<dyn RemoteSource>)).await?,
    );
    let report = orchestrator.initialize().await?;
    println!(
        "initialized: {} patterns from {} ({} fetched, {} rejected, {}ms)",
        report.pattern_count, report.source, report.records_fetched, report.conversion_errors, report.elapsed_ms
    );

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Consumer queries
    // ─────────────────────────────────────────────────────────────────────────
    let mut view = orchestrator.view();
    let lines = [
        "2026/01/04 upstream timed out (110: Connection timed out) while reading",
        "ERROR:  deadlock detected",
        "Exception in thread main java.lang.OutOfMemoryError: Java heap space",
        "all good here",
    ];
    let snapshot = view.get_patterns();
    for line in lines {
        let hits: Vec<&str> = snapshot
            .iter()
            .filter(|p| p.is_match(line))
            .map(|p| p.id.as_str())
            .collect();
        println!("  {line:<72} -> {hits:?}");
    }
    println!("network patterns: {}", view.get_patterns_by_category("network").len());
    println!("nginx patterns:   {}", view.get_patterns_by_product("nginx").len());

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Hot reload
    // ─────────────────────────────────────────────────────────────────────────
    source.push(record("disk-full", "linux", "resources", "critical", r"No space left on device"));
    let report = orchestrator.force_refresh().await?;
    println!("\nforce refresh: {} patterns, published: {}", report.pattern_count, report.published);
    if view.has_changed() {
        view.changed().await;
        println!("view saw the new snapshot: {} patterns", view.get_patterns().len());
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Remote outage
    // ─────────────────────────────────────────────────────────────────────────
    source.fail_with(Some(NetworkError::Refused("maintenance window".into())));
    let resolution = orchestrator.resolve().await?;
    println!(
        "\nremote down: served {} patterns from {} (degraded: {})",
        resolution.snapshot.len(),
        resolution.source,
        resolution.degraded
    );
    for warning in &resolution.warnings {
        println!("  warning: {warning}");
    }
    source.fail_with(None);

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Background refresh
    // ─────────────────────────────────────────────────────────────────────────
    orchestrator.start_auto_refresh();
    println!("\nstate: {}", orchestrator.state());
    tokio::time::sleep(Duration::from_millis(2500)).await;

    let state = orchestrator.sync_state();
    println!(
        "after background ticks: {} remote fetches, {} skipped ticks, last source {:?}",
        state.remote_fetches, state.skipped_ticks, state.last_source
    );

    let stats = orchestrator.get_cache_stats();
    println!("cache stats: {}", serde_json::to_string_pretty(&stats)?);

    orchestrator.shutdown().await;
    println!("state: {}", orchestrator.state());

    // ─────────────────────────────────────────────────────────────────────────
    // 6. Metrics
    // ─────────────────────────────────────────────────────────────────────────
    print_metrics(&snapshotter);

    Ok(())
}

fn print_metrics(snapshotter: &Snapshotter) {
    println!("\n--- metrics ---");
    let mut rows: Vec<(String, String)> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(key, _, _, value)| {
            let key = key.key();
            let labels: Vec<String> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
            let name = if labels.is_empty() {
                key.name().to_string()
            } else {
                format!("{}{{{}}}", key.name(), labels.join(","))
            };
            let value = match value {
                DebugValue::Counter(v) => v.to_string(),
                DebugValue::Gauge(v) => format!("{:.2}", v.into_inner()),
                DebugValue::Histogram(v) => format!("{} samples", v.len()),
            };
            (name, value)
        })
        .collect();
    rows.sort();
    for (name, value) in rows {
        println!("  {name:<60} {value}");
    }
}
