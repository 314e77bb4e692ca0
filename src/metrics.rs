//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Pull cycles (documents, debounces, errors, latency)
//! - Push batches and conflicts
//! - Realtime change-feed events
//! - Merge decisions by source
//! - In-flight pull requests and admission waits
//! - Session lifecycle and total-count fetches
//!
//! No exporter is bundled; install any `metrics` recorder in the host.
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `entity_replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use entity_replication::metrics;
//! use std::time::Duration;
//!
//! metrics::record_pull("breed", 42, Duration::from_millis(80));
//! metrics::record_push("breed", 10, 1);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a completed pull cycle.
pub fn record_pull(entity_type: &str, documents: usize, duration: Duration) {
    counter!("entity_replication_pull_cycles_total", "entity_type" => entity_type.to_string()).increment(1);
    counter!("entity_replication_pull_documents_total", "entity_type" => entity_type.to_string())
        .increment(documents as u64);
    histogram!("entity_replication_pull_duration_seconds", "entity_type" => entity_type.to_string())
        .record(duration.as_secs_f64());
}

/// Record a pull skipped by the debounce window.
pub fn record_pull_debounced(entity_type: &str) {
    counter!("entity_replication_pull_debounced_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Record a failed remote fetch during pull.
pub fn record_pull_error(entity_type: &str) {
    counter!("entity_replication_pull_errors_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Record a pull whose result was dropped because the session stopped.
pub fn record_pull_discarded(entity_type: &str) {
    counter!("entity_replication_pull_discarded_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Record a merge decision. `source` is `pull`, `realtime` or `full_sync`.
pub fn record_merge_decision(entity_type: &str, source: &str, decision: &str) {
    counter!(
        "entity_replication_merge_decisions_total",
        "entity_type" => entity_type.to_string(),
        "source" => source.to_string(),
        "decision" => decision.to_string()
    )
    .increment(1);
}

/// Record a push batch.
pub fn record_push(entity_type: &str, rows: usize, conflicts: usize) {
    counter!("entity_replication_push_batches_total", "entity_type" => entity_type.to_string()).increment(1);
    counter!("entity_replication_push_rows_total", "entity_type" => entity_type.to_string()).increment(rows as u64);
    if conflicts > 0 {
        counter!("entity_replication_push_conflicts_total", "entity_type" => entity_type.to_string())
            .increment(conflicts as u64);
    }
}

/// Record a realtime change-feed event.
pub fn record_realtime_event(entity_type: &str, kind: &str, outcome: &str) {
    counter!(
        "entity_replication_realtime_events_total",
        "entity_type" => entity_type.to_string(),
        "kind" => kind.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set whether the realtime subscription is open.
pub fn set_realtime_subscribed(entity_type: &str, subscribed: bool) {
    gauge!("entity_replication_realtime_subscribed", "entity_type" => entity_type.to_string())
        .set(if subscribed { 1.0 } else { 0.0 });
}

/// Record a pull admitted over the in-flight cap.
pub fn record_admission_wait(entity_type: &str) {
    counter!("entity_replication_admission_waits_total", "entity_type" => entity_type.to_string()).increment(1);
}

/// Set current in-flight pulls.
pub fn set_in_flight(entity_type: &str, in_flight: usize) {
    gauge!("entity_replication_in_flight", "entity_type" => entity_type.to_string()).set(in_flight as f64);
}

/// Record an exact-count remote query.
pub fn record_total_count_fetch(entity_type: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "entity_replication_total_count_fetches_total",
        "entity_type" => entity_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set the cached total row count.
pub fn set_total_count(entity_type: &str, count: u64) {
    gauge!("entity_replication_total_count", "entity_type" => entity_type.to_string()).set(count as f64);
}

/// Record a `setup_replication` attempt.
pub fn record_session_setup(entity_type: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "entity_replication_session_setups_total",
        "entity_type" => entity_type.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set number of active sessions.
pub fn set_active_sessions(count: usize) {
    gauge!("entity_replication_active_sessions").set(count as f64);
}

/// Record a full snapshot reconciliation.
pub fn record_full_sync(entity_type: &str, success: bool, documents: usize, duration: Duration) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "entity_replication_full_syncs_total",
        "entity_type" => entity_type.to_string(),
        "status" => status
    )
    .increment(1);
    if success {
        histogram!("entity_replication_full_sync_documents", "entity_type" => entity_type.to_string())
            .record(documents as f64);
        histogram!("entity_replication_full_sync_duration_seconds", "entity_type" => entity_type.to_string())
            .record(duration.as_secs_f64());
    }
}

/// Record a manual pull.
pub fn record_manual_pull(entity_type: &str, received: usize, timed_out: bool) {
    let outcome = if timed_out { "timeout" } else { "received" };
    counter!(
        "entity_replication_manual_pulls_total",
        "entity_type" => entity_type.to_string(),
        "outcome" => outcome
    )
    .increment(1);
    histogram!("entity_replication_manual_pull_documents", "entity_type" => entity_type.to_string())
        .record(received as f64);
}

/// Record durable store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn durable_retries_total(operation: &str) {
    counter!("entity_replication_durable_retries_total", "operation" => operation.to_string()).increment(1);
}
