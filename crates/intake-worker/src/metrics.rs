//! Prometheus metrics for the worker.

use std::net::SocketAddr;

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder and serve it on `addr`.
///
/// Must be called from within the Tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> WorkerResult<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| WorkerError::config_error(format!("failed to start metrics listener: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_RECEIVED_TOTAL: &str = "intake_worker_jobs_received_total";
    pub const JOBS_COMPLETED_TOTAL: &str = "intake_worker_jobs_completed_total";
    pub const JOBS_FAILED_TOTAL: &str = "intake_worker_jobs_failed_total";
    pub const JOBS_RETRIED_TOTAL: &str = "intake_worker_jobs_retried_total";
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "intake_worker_jobs_dead_lettered_total";
    pub const JOB_DURATION_SECONDS: &str = "intake_worker_job_duration_seconds";
    pub const ARTIFACT_BYTES: &str = "intake_worker_artifact_bytes";
    pub const JOBS_IN_FLIGHT: &str = "intake_worker_jobs_in_flight";
}

pub fn record_jobs_received(count: usize) {
    counter!(names::JOBS_RECEIVED_TOTAL).increment(count as u64);
}

/// Record job completed.
pub fn record_job_completed(analyzer: &str, byte_length: u64, duration_secs: f64) {
    let labels = [("analyzer", analyzer.to_string())];
    counter!(names::JOBS_COMPLETED_TOTAL, &labels).increment(1);
    histogram!(names::JOB_DURATION_SECONDS, &labels).record(duration_secs);
    histogram!(names::ARTIFACT_BYTES).record(byte_length as f64);
}

/// Record job failed.
pub fn record_job_failed(error: &WorkerError) {
    let labels = [("kind", error.kind().to_string())];
    counter!(names::JOBS_FAILED_TOTAL, &labels).increment(1);
}

pub fn record_job_retried() {
    counter!(names::JOBS_RETRIED_TOTAL).increment(1);
}

pub fn record_job_dead_lettered(error: &WorkerError) {
    let labels = [("kind", error.kind().to_string())];
    counter!(names::JOBS_DEAD_LETTERED_TOTAL, &labels).increment(1);
}

pub fn job_started() {
    gauge!(names::JOBS_IN_FLIGHT).increment(1.0);
}

pub fn job_finished() {
    gauge!(names::JOBS_IN_FLIGHT).decrement(1.0);
}
