//! Prometheus metrics for silovault.
//!
//! Installs a global Prometheus recorder using
//! `metrics-exporter-prometheus`, defines metric name constants, provides
//! a middleware for HTTP RED metrics, and exposes the `/metrics` endpoint
//! handler.

use axum::extract::Request;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

// -- Metric name constants ----------------------------------------------------

/// Total HTTP requests (counter). Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "silovault_http_requests_total";

/// HTTP request duration in seconds (histogram). Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "silovault_http_request_duration_seconds";

/// Total object operations (counter). Labels: operation.
pub const OBJECT_OPERATIONS_TOTAL: &str = "silovault_object_operations_total";

/// Total bytes received in upload bodies (counter).
pub const BYTES_RECEIVED_TOTAL: &str = "silovault_bytes_received_total";

/// Total bytes sent in download bodies (counter).
pub const BYTES_SENT_TOTAL: &str = "silovault_bytes_sent_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent — safe to
/// call multiple times (e.g. in tests). Returns the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once
/// after `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Total HTTP requests");
    describe_histogram!(
        HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_counter!(OBJECT_OPERATIONS_TOTAL, "Total object operations by type");
    describe_counter!(BYTES_RECEIVED_TOTAL, "Total bytes received (upload bodies)");
    describe_counter!(BYTES_SENT_TOTAL, "Total bytes sent (download bodies)");
}

// -- Metrics middleware -------------------------------------------------------

/// Middleware that records HTTP RED metrics for every request.
///
/// Excludes `/metrics` from self-instrumentation to avoid feedback
/// loops. Must be the outermost layer so it captures the full request
/// lifecycle.
pub async fn metrics_middleware(req: Request, next: axum::middleware::Next) -> Response {
    let method = req.method().to_string();
    let path = normalize_path(req.uri().path());

    if req.uri().path() == "/metrics" {
        return next.run(req).await;
    }

    let start = Instant::now();
    let response = next.run(req).await;
    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

// -- Path normalization -------------------------------------------------------

/// Normalize a request path for metric labels.
///
/// Every non-reserved path is an object key, so they all collapse to one
/// template — unique keys would otherwise explode label cardinality.
fn normalize_path(path: &str) -> String {
    match path {
        "/ping" | "/metrics" => path.to_string(),
        _ => "/{key}".to_string(),
    }
}

// -- Metrics endpoint handler -------------------------------------------------

/// `GET /metrics` — render Prometheus exposition format text.
pub async fn metrics_handler() -> impl IntoResponse {
    let Some(handle) = PROMETHEUS_HANDLE.get() else {
        return (StatusCode::SERVICE_UNAVAILABLE, String::new()).into_response();
    };
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        handle.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_reserved_paths() {
        assert_eq!(normalize_path("/ping"), "/ping");
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }

    #[test]
    fn test_normalize_object_keys_collapse() {
        assert_eq!(normalize_path("/"), "/{key}");
        assert_eq!(normalize_path("/foo"), "/{key}");
        assert_eq!(normalize_path("/deep/nested/key.bin"), "/{key}");
    }
}
