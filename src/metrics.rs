//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Version sequencing (collisions, stale writes, exhausted budgets)
//! - Replication throughput and cycle outcomes
//! - Cursor advances
//! - Connection and tunnel pool utilisation
//! - Bulkhead and circuit breaker state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use origin_replication::metrics;
//! use origin_replication::model::EntityKind;
//! use std::time::Duration;
//!
//! metrics::record_records_pulled("@remote", EntityKind::Extension, 42);
//! metrics::record_cycle("@remote", "pull", "success", Duration::from_millis(350));
//! ```

use crate::error::ReplicationError;
use crate::model::EntityKind;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Store & Sequencer Metrics
// =============================================================================

/// Record a SQLite busy retry.
pub fn record_store_retry(operation: &str) {
    counter!("replication_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record an `(origin, modified)` collision that was re-stamped.
pub fn record_version_collision(kind: EntityKind) {
    counter!("replication_version_collisions_total", "kind" => kind.as_str()).increment(1);
}

/// Record a write that ran out of collision retries.
pub fn record_collision_exhausted(kind: EntityKind) {
    counter!("replication_version_collisions_exhausted_total", "kind" => kind.as_str()).increment(1);
}

/// Record a replicated write that hit a foreign version.
pub fn record_duplicate_version(kind: EntityKind) {
    counter!("replication_duplicate_versions_total", "kind" => kind.as_str()).increment(1);
}

/// Record a committed write.
pub fn record_write(kind: EntityKind, operation: &'static str) {
    counter!("replication_writes_total", "kind" => kind.as_str(), "operation" => operation).increment(1);
}

/// Record a failed write, labelled by error class.
pub fn record_write_error(kind: EntityKind, operation: &'static str, error: &ReplicationError) {
    if matches!(error, ReplicationError::StaleWrite { .. }) {
        counter!("replication_stale_writes_total", "kind" => kind.as_str()).increment(1);
    }
    counter!(
        "replication_write_errors_total",
        "kind" => kind.as_str(),
        "operation" => operation,
        "error" => error.kind_label()
    )
    .increment(1);
}

// =============================================================================
// Replication Metrics
// =============================================================================

/// Record a cursor advance for one origin and kind.
pub fn record_cursor_advance(origin: &str, kind: EntityKind, cursor_micros: i64) {
    counter!("replication_cursor_advances_total", "origin" => origin.to_string(), "kind" => kind.as_str())
        .increment(1);
    gauge!("replication_cursor_micros", "origin" => origin.to_string(), "kind" => kind.as_str())
        .set(cursor_micros as f64);
}

/// Record records ingested from a remote origin.
pub fn record_records_pulled(origin: &str, kind: EntityKind, count: usize) {
    counter!("replication_records_pulled_total", "origin" => origin.to_string(), "kind" => kind.as_str())
        .increment(count as u64);
}

/// Record records sent to a remote origin.
pub fn record_records_pushed(origin: &str, kind: EntityKind, count: usize) {
    counter!("replication_records_pushed_total", "origin" => origin.to_string(), "kind" => kind.as_str())
        .increment(count as u64);
}

/// Record a failure confined to one kind within a cycle.
pub fn record_kind_error(origin: &str, kind: EntityKind, error: &ReplicationError) {
    counter!(
        "replication_kind_errors_total",
        "origin" => origin.to_string(),
        "kind" => kind.as_str(),
        "error" => error.kind_label()
    )
    .increment(1);
}

/// Record a finished replication cycle.
pub fn record_cycle(origin: &str, direction: &'static str, outcome: &'static str, duration: Duration) {
    counter!(
        "replication_cycles_total",
        "origin" => origin.to_string(),
        "direction" => direction,
        "outcome" => outcome
    )
    .increment(1);
    histogram!(
        "replication_cycle_duration_seconds",
        "origin" => origin.to_string(),
        "direction" => direction
    )
    .record(duration.as_secs_f64());
}

/// Record a remote request latency.
pub fn record_remote_latency(origin: &str, operation: &'static str, duration: Duration) {
    histogram!(
        "replication_remote_request_seconds",
        "origin" => origin.to_string(),
        "operation" => operation
    )
    .record(duration.as_secs_f64());
}

/// Gauge for engine state.
pub fn set_engine_state(state: &str) {
    // 0=created, 1=running, 2=shutting down, 3=stopped, 4=failed
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        "Failed" => 4.0,
        _ => -1.0,
    };
    gauge!("replication_engine_state").set(value);
}

// =============================================================================
// Pool Metrics
// =============================================================================

/// Record a lazily created HTTP pool.
pub fn record_pool_created(tenant: &str, mode: &'static str) {
    counter!("replication_pools_created_total", "tenant" => tenant.to_string(), "mode" => mode).increment(1);
}

/// Publish a utilisation snapshot for one pool.
pub fn record_pool_stats(tenant: &str, mode: &'static str, leased: usize, available: usize, pending: usize) {
    gauge!("replication_pool_leased", "tenant" => tenant.to_string(), "mode" => mode).set(leased as f64);
    gauge!("replication_pool_available", "tenant" => tenant.to_string(), "mode" => mode).set(available as f64);
    gauge!("replication_pool_pending", "tenant" => tenant.to_string(), "mode" => mode).set(pending as f64);
}

/// Record a tunnel lifecycle event (opened, reused, released, evicted, failed).
pub fn record_tunnel_event(event: &'static str) {
    counter!("replication_tunnel_events_total", "event" => event).increment(1);
}

pub fn set_live_tunnels(count: usize) {
    gauge!("replication_tunnels_live").set(count as f64);
}

// =============================================================================
// Resilience Metrics
// =============================================================================

/// Record a cycle rejected because the bulkhead had no free slot.
pub fn record_bulkhead_rejection(direction: &'static str) {
    counter!("replication_bulkhead_rejections_total", "direction" => direction).increment(1);
}

pub fn set_bulkhead_in_flight(in_flight: usize) {
    gauge!("replication_bulkhead_in_flight").set(in_flight as f64);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &str) {
    counter!(
        "replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set circuit breaker state gauge (0=closed, 1=half_open, 2=open).
pub fn set_circuit_state(circuit_name: &str, state: &str) {
    let value = match state {
        "closed" => 0.0,
        "half_open" => 1.0,
        "open" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_circuit_state", "circuit" => circuit_name.to_string()).set(value);
}
