//! Prometheus metrics for the API server.

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::{Request, Response};
use axum::middleware::Next;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Initialize the Prometheus metrics recorder.
/// Returns a handle that can be used to render metrics.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Metric names as constants for consistency.
pub mod names {
    // HTTP metrics
    pub const HTTP_REQUESTS_TOTAL: &str = "intake_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "intake_http_request_duration_seconds";
    pub const HTTP_REQUESTS_IN_FLIGHT: &str = "intake_http_requests_in_flight";

    // Queue metrics
    pub const JOBS_ENQUEUED_TOTAL: &str = "intake_jobs_enqueued_total";
    pub const QUEUE_DEPTH: &str = "intake_queue_depth";
    pub const QUEUE_DLQ_DEPTH: &str = "intake_queue_dlq_depth";
}

/// Record an HTTP request.
pub fn record_http_request(method: &str, path: &str, status: u16, duration_secs: f64) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];

    counter!(names::HTTP_REQUESTS_TOTAL, &labels).increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, &labels).record(duration_secs);
}

/// Record a job published to the queue.
pub fn record_job_enqueued() {
    counter!(names::JOBS_ENQUEUED_TOTAL).increment(1);
}

/// Update queue depth gauges.
pub fn set_queue_depth(depth: u64, dead_letters: u64) {
    gauge!(names::QUEUE_DEPTH).set(depth as f64);
    gauge!(names::QUEUE_DLQ_DEPTH).set(dead_letters as f64);
}

/// Label for a request path: the matched route, or a fixed bucket for
/// unmatched paths so arbitrary URLs can't blow up label cardinality.
fn path_label(request: &Request<Body>) -> String {
    request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string())
}

/// Metrics middleware for HTTP requests.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response<Body> {
    let method = request.method().to_string();
    let path = path_label(&request);
    let start = Instant::now();

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).increment(1.0);

    let response = next.run(request).await;

    gauge!(names::HTTP_REQUESTS_IN_FLIGHT).decrement(1.0);

    let status = response.status().as_u16();
    let duration = start.elapsed().as_secs_f64();

    record_http_request(&method, &path, status, duration);

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmatched_path_label() {
        let request = Request::builder()
            .uri("/does/not/exist/12345")
            .body(Body::empty())
            .unwrap();
        assert_eq!(path_label(&request), "unmatched");
    }
}
