//! Metrics definitions for the state service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `state_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded by code:
//! - `operation`: store commands (~14 values)
//! - `kind`: store failure kinds (unavailable, rejected)
//! - `outcome`: per-metric fixed sets listed on each function
//! - `action`: rate-limited actions defined by callers (login, api, ...)
//! - `task_type`/`priority`: task types known to the service, 3 priorities
//! - `reason`: dropped-message reasons (full, closed)
//!
//! Session keys, user ids and client addresses are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::time::Duration;

/// Install the Prometheus recorder and its scrape listener on `bind_address`.
///
/// Must be called from inside a Tokio runtime, before any metric is recorded.
///
/// # Errors
///
/// Returns error if the buckets are invalid or a recorder is already installed.
pub fn init_metrics_recorder(bind_address: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(bind_address)
        // Store latency buckets - in-datacenter round trips, p99 target < 10ms
        .set_buckets_for_metric(
            Matcher::Prefix("state_store".to_string()),
            &[
                0.0005, 0.001, 0.0025, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set store latency buckets: {e}"))?
        .install()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Store Metrics
// ============================================================================

/// Record one store call attempt.
///
/// Metric: `state_store_latency_seconds`
/// Labels: `operation`
pub fn record_store_latency(operation: &'static str, duration: Duration) {
    histogram!("state_store_latency_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
}

/// Record a failed store call attempt.
///
/// Metric: `state_store_failures_total`
/// Labels: `operation`, `kind` (unavailable, rejected)
pub fn record_store_failure(operation: &'static str, kind: &'static str) {
    counter!("state_store_failures_total", "operation" => operation, "kind" => kind)
        .increment(1);
}

// ============================================================================
// Session Metrics
// ============================================================================

/// Record a session validation result.
///
/// Metric: `state_session_validations_total`
/// Labels: `outcome` (valid, missing, malformed, expired, store_unavailable)
pub fn record_session_validation(outcome: &'static str) {
    counter!("state_session_validations_total", "outcome" => outcome).increment(1);
}

/// Metric: `state_session_refreshes_total`
pub fn record_session_refresh() {
    counter!("state_session_refreshes_total").increment(1);
}

/// Record a sweep pass.
///
/// Metric: `state_session_sweep_total`
/// Labels: `outcome` (completed, failed, skipped)
///
/// Also adds `removed` to `state_session_sweep_removed_total`.
pub fn record_session_sweep(outcome: &'static str, removed: u64) {
    counter!("state_session_sweep_total", "outcome" => outcome).increment(1);
    if removed > 0 {
        counter!("state_session_sweep_removed_total").increment(removed);
    }
}

// ============================================================================
// Rate Limit / Cache / Queue Metrics
// ============================================================================

/// Record a rate-limit decision.
///
/// Metric: `state_rate_limit_decisions_total`
/// Labels: `action`, `outcome` (allowed, rejected, degraded_allow, degraded_reject)
pub fn record_rate_limit_decision(action: &str, outcome: &'static str) {
    counter!(
        "state_rate_limit_decisions_total",
        "action" => action.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a cache lookup.
///
/// Metric: `state_cache_lookups_total`
/// Labels: `outcome` (hit, miss, error)
pub fn record_cache_lookup(outcome: &'static str) {
    counter!("state_cache_lookups_total", "outcome" => outcome).increment(1);
}

/// Metric: `state_tasks_enqueued_total`
/// Labels: `task_type`, `priority` (high, medium, low)
pub fn record_task_enqueued(task_type: &str, priority: &'static str) {
    counter!(
        "state_tasks_enqueued_total",
        "task_type" => task_type.to_string(),
        "priority" => priority
    )
    .increment(1);
}

// ============================================================================
// Connection Metrics
// ============================================================================

/// Set the number of registered realtime connections.
///
/// Metric: `state_connections_active`
pub fn set_connections_active(count: usize) {
    // usize to f64 conversion is safe for realistic connection counts (< 2^53)
    #[allow(clippy::cast_precision_loss)]
    gauge!("state_connections_active").set(count as f64);
}

/// Record a realtime message that was not delivered.
///
/// Metric: `state_connection_messages_dropped_total`
/// Labels: `reason` (full, closed)
pub fn record_message_dropped(reason: &'static str) {
    counter!("state_connection_messages_dropped_total", "reason" => reason).increment(1);
}
