//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Events dispatched and skipped
//! - Batches read and bookmark position
//! - Outstanding and abandoned gaps
//! - Lease outcomes
//! - Iteration failures and daemon state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_cursor_` and follow Prometheus
//! conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! Nothing is exported unless the embedding process installs a recorder.

use metrics::{counter, gauge, histogram};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// Record an event handed to a registered handler.
pub fn record_event_dispatched(kind: &str) {
    counter!("replication_cursor_events_dispatched_total", "kind" => kind.to_string()).increment(1);
}

/// Record an event skipped by the dispatcher (`reason`: unresolved, out_of_shard).
pub fn record_event_skipped(reason: &'static str) {
    counter!("replication_cursor_events_skipped_total", "reason" => reason).increment(1);
}

/// Record a completed batch.
pub fn record_batch(size: usize, duration: Duration) {
    counter!("replication_cursor_batches_total").increment(1);
    histogram!("replication_cursor_batch_size").record(size as f64);
    histogram!("replication_cursor_batch_duration_seconds").record(duration.as_secs_f64());
}

/// Gauge for the last persisted bookmark.
pub fn set_bookmark(last_processed_id: i64) {
    gauge!("replication_cursor_bookmark").set(last_processed_id as f64);
}

/// Gauge for outstanding gaps.
pub fn set_outstanding_gaps(count: usize) {
    gauge!("replication_cursor_gaps_outstanding").set(count as f64);
}

/// Record gaps newly detected.
pub fn record_gaps_detected(count: usize) {
    counter!("replication_cursor_gaps_detected_total").increment(count as u64);
}

/// Record gaps backfilled (entry showed up and was dispatched).
pub fn record_gaps_resolved(count: usize) {
    counter!("replication_cursor_gaps_resolved_total").increment(count as u64);
}

/// Record gaps given up on (`reason`: expired, overflow).
pub fn record_gaps_abandoned(count: usize, reason: &'static str) {
    counter!("replication_cursor_gaps_abandoned_total", "reason" => reason).increment(count as u64);
}

/// Record lease acquisition outcome (`granted`, `denied`, `error`).
pub fn record_lease_acquire(outcome: &'static str) {
    counter!("replication_cursor_lease_acquire_total", "outcome" => outcome).increment(1);
}

/// Record a lost lease detected on renewal.
pub fn record_lease_lost() {
    counter!("replication_cursor_lease_lost_total").increment(1);
}

/// Record a failed iteration by error kind.
pub fn record_iteration_failure(error_type: &'static str) {
    counter!("replication_cursor_iteration_failures_total", "error_type" => error_type).increment(1);
}

/// Record SQLite busy retries.
pub fn record_store_retry(operation: &str) {
    counter!("replication_cursor_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Gauge for daemon state.
pub fn set_daemon_state(state: &str) {
    let value = match state {
        "Idle" => 0.0,
        "CheckingRole" => 1.0,
        "NotEligible" => 2.0,
        "Leasing" => 3.0,
        "Fetching" => 4.0,
        "Processing" => 5.0,
        "Sleeping" => 6.0,
        "Exiting" => 7.0,
        _ => -1.0,
    };
    gauge!("replication_cursor_daemon_state").set(value);
}

/// Run `fut`, logging and recording how long it took.
///
/// Used around operations that can be slow (gap backfill, batch reads).
pub async fn timed<F, T>(label: &'static str, fut: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    let out = fut.await;
    let elapsed = start.elapsed();
    histogram!("replication_cursor_operation_duration_seconds", "operation" => label)
        .record(elapsed.as_secs_f64());
    debug!(operation = label, duration_ms = elapsed.as_millis() as u64, "Timed operation finished");
    out
}
