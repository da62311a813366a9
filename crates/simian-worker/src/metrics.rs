//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Start the Prometheus scrape listener on `addr`.
pub fn init_metrics(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("metrics exporter: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    // Lease protocol
    pub const CLAIMS_TOTAL: &str = "simian_claims_total";
    pub const CLAIMS_EMPTY_TOTAL: &str = "simian_claims_empty_total";
    pub const CLAIM_ERRORS_TOTAL: &str = "simian_claim_errors_total";
    pub const LEASE_RENEWALS_TOTAL: &str = "simian_lease_renewals_total";
    pub const LEASES_LOST_TOTAL: &str = "simian_leases_lost_total";

    // Cycles
    pub const CYCLES_TOTAL: &str = "simian_cycles_total";
    pub const CYCLE_FAILURES_TOTAL: &str = "simian_cycle_failures_total";
    pub const RENDER_DURATION_SECONDS: &str = "simian_render_duration_seconds";
    pub const UPLOAD_DURATION_SECONDS: &str = "simian_upload_duration_seconds";

    // Sweeps
    pub const SWEEP_REQUEUED_TOTAL: &str = "simian_sweep_requeued_total";
    pub const SWEEP_DEAD_LETTERED_TOTAL: &str = "simian_sweep_dead_lettered_total";
    pub const SWEEP_FAILURES_TOTAL: &str = "simian_sweep_failures_total";
}

/// Record a claim attempt.
pub fn record_claim(found: bool) {
    if found {
        counter!(names::CLAIMS_TOTAL).increment(1);
    } else {
        counter!(names::CLAIMS_EMPTY_TOTAL).increment(1);
    }
}

/// Record a claim that failed with a store error.
pub fn record_claim_error(unavailable: bool) {
    let labels = [("kind", if unavailable { "unavailable" } else { "error" }.to_string())];
    counter!(names::CLAIM_ERRORS_TOTAL, &labels).increment(1);
}

/// Record a lease renewal.
pub fn record_renewal(renewed: bool) {
    let labels = [("result", if renewed { "renewed" } else { "lost" }.to_string())];
    counter!(names::LEASE_RENEWALS_TOTAL, &labels).increment(1);
}

/// Record a lease lost mid-cycle.
pub fn record_lease_lost() {
    counter!(names::LEASES_LOST_TOTAL).increment(1);
}

/// Record a finished cycle.
pub fn record_cycle(outcome: &str) {
    let labels = [("outcome", outcome.to_string())];
    counter!(names::CYCLES_TOTAL, &labels).increment(1);
}

/// Record a cycle failure.
pub fn record_cycle_failure(kind: &str) {
    let labels = [("kind", kind.to_string())];
    counter!(names::CYCLE_FAILURES_TOTAL, &labels).increment(1);
}

/// Record render duration.
pub fn record_render_duration(duration_secs: f64) {
    histogram!(names::RENDER_DURATION_SECONDS).record(duration_secs);
}

/// Record upload duration.
pub fn record_upload_duration(duration_secs: f64) {
    histogram!(names::UPLOAD_DURATION_SECONDS).record(duration_secs);
}

/// Record a sweep result.
pub fn record_sweep(requeued: u64, dead_lettered: u64) {
    counter!(names::SWEEP_REQUEUED_TOTAL).increment(requeued);
    counter!(names::SWEEP_DEAD_LETTERED_TOTAL).increment(dead_lettered);
}

/// Record a failed sweep.
pub fn record_sweep_failure() {
    counter!(names::SWEEP_FAILURES_TOTAL).increment(1);
}
