//! Prometheus metrics exposition
//!
//! - `proxy_requests_total` (counter): labels `status`, `route`
//! - `proxy_request_duration_seconds` (histogram): label `route`
//! - `proxy_error_responses_total` (counter): label `type`
//!
//! `proxy_upstream_errors_total` and `qwen_account_rotations_total` are
//! emitted by the router crate and rendered through the same recorder.

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

const DURATION_METRIC: &str = "proxy_request_duration_seconds";

/// 5ms to the 300s upstream ceiling
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(DURATION_METRIC.to_string()), DURATION_BUCKETS)
        .expect("histogram buckets are non-empty")
}

/// Install the global Prometheus recorder and return a handle for rendering.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Recorder/handle pair that is not installed globally, for tests.
#[cfg(test)]
pub fn local_recorder() -> (
    metrics_exporter_prometheus::PrometheusRecorder,
    PrometheusHandle,
) {
    let recorder = builder().build_recorder();
    let handle = recorder.handle();
    (recorder, handle)
}

/// Record a completed request on one of the API routes.
pub fn record_request(status: u16, route: &'static str, duration_secs: f64) {
    metrics::counter!("proxy_requests_total", "status" => status.to_string(), "route" => route)
        .increment(1);
    metrics::histogram!(DURATION_METRIC, "route" => route).record(duration_secs);
}

/// Record an error body sent to a client.
pub fn record_error_response(error_type: &'static str) {
    metrics::counter!("proxy_error_responses_total", "type" => error_type).increment(1);
}
