//! Upstream failure classification
//!
//! All free-text matching on provider error messages lives here. Precedence
//! is quota, then auth, then local timeout, then fatal: a message matching
//! both quota and auth patterns is a quota error.

use provider::{ErrorClassification, UpstreamFailure};

const QUOTA_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "insufficient quota",
    "free allocated quota exceeded",
    "quota exceeded",
];

const AUTH_STATUSES: &[u16] = &[400, 401, 403, 504];

const AUTH_PATTERNS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid access token",
    "token expired",
    "authentication",
    "access denied",
    "gateway timeout",
    "504",
];

pub fn classify(failure: &UpstreamFailure) -> ErrorClassification {
    let message = failure.message.to_lowercase();

    if is_quota_exceeded(failure.status, &message) {
        return ErrorClassification::QuotaExceeded;
    }
    if is_auth_error(failure.status, &message) {
        return ErrorClassification::AuthError;
    }
    if failure.timed_out {
        return ErrorClassification::Timeout;
    }
    ErrorClassification::Fatal
}

fn is_quota_exceeded(status: Option<u16>, message: &str) -> bool {
    status == Some(429)
        || QUOTA_PATTERNS.iter().any(|p| message.contains(p))
        || (message.contains("quota") && message.contains("exceeded"))
}

fn is_auth_error(status: Option<u16>, message: &str) -> bool {
    status.is_some_and(|s| AUTH_STATUSES.contains(&s))
        || AUTH_PATTERNS.iter().any(|p| message.contains(p))
        || (message.contains("token") && message.contains("expired"))
}
