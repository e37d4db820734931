// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` crate facade; the host application installs the
//! exporter (Prometheus, OTEL, etc.).
//!
//! # Metric Naming Convention
//! - `docsync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `operation`: get, put, delete, resolve, apply
//! - `status`: success, error, rejected
//! - `origin`: local, sync
//! - `direction`: sent, received, applied, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a store operation outcome
pub fn record_operation(operation: &str, status: &str) {
    counter!(
        "docsync_operations_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record store operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "docsync_operation_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a newly detected conflict
pub fn record_conflict(origin: &str) {
    counter!(
        "docsync_conflicts_detected_total",
        "origin" => origin.to_string()
    )
    .increment(1);
}

/// Set the local generation counter of a replica
pub fn set_local_generation(replica_uid: &str, generation: u64) {
    gauge!(
        "docsync_local_generation",
        "replica" => replica_uid.to_string()
    )
    .set(generation as f64);
}

/// Record the end of a sync session
pub fn record_sync_session(status: &str) {
    counter!(
        "docsync_sync_sessions_total",
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record sync session wall time
pub fn record_sync_duration(duration: Duration) {
    histogram!("docsync_sync_session_seconds").record(duration.as_secs_f64());
}

/// Record records moved by a sync session
pub fn record_sync_records(direction: &str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "docsync_sync_records_total",
        "direction" => direction.to_string()
    )
    .increment(count as u64);
}

/// Record a circuit breaker call
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "docsync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a row that could not be decoded
pub fn record_corruption(doc_id: &str) {
    counter!(
        "docsync_corruption_detected_total",
        "doc_id" => doc_id.to_string()
    )
    .increment(1);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
