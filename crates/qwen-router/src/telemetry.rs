//! Router metrics, recorded through the `metrics` facade. The binary
//! installs the Prometheus recorder.

use provider::ErrorClassification;

use crate::state::RotationReason;

pub(crate) fn record_upstream_error(classification: ErrorClassification) {
    metrics::counter!(
        "proxy_upstream_errors_total",
        "classification" => classification.label()
    )
    .increment(1);
}

pub(crate) fn record_rotation(reason: RotationReason) {
    metrics::counter!("qwen_account_rotations_total", "reason" => reason.label()).increment(1);
}
