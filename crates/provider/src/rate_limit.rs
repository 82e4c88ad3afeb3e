//! Rate-limit header pass-through
//!
//! The provider's rate-limit headers are copied onto the gateway response
//! under their conventional OpenAI-style names.

use std::collections::BTreeMap;

use reqwest::header::HeaderMap;

/// Provider header name (lowercase) to the name exposed to callers.
const HEADER_MAPPINGS: &[(&str, &str)] = &[
    ("x-ratelimit-limit", "X-RateLimit-Limit"),
    ("x-ratelimit-remaining", "X-RateLimit-Remaining"),
    ("x-ratelimit-reset", "X-RateLimit-Reset"),
    ("x-ratelimit-limit-requests", "X-RateLimit-Limit-Requests"),
    ("x-ratelimit-limit-tokens", "X-RateLimit-Limit-Tokens"),
    ("x-ratelimit-remaining-requests", "X-RateLimit-Remaining-Requests"),
    ("x-ratelimit-remaining-tokens", "X-RateLimit-Remaining-Tokens"),
    ("x-ratelimit-reset-requests", "X-RateLimit-Reset-Requests"),
    ("x-ratelimit-reset-tokens", "X-RateLimit-Reset-Tokens"),
    ("retry-after", "Retry-After"),
];

/// Extract the known rate-limit headers. Values that are not valid visible
/// ASCII are skipped.
pub fn extract_rate_limit_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    HEADER_MAPPINGS
        .iter()
        .filter_map(|(upstream, standard)| {
            let value = headers.get(*upstream)?.to_str().ok()?;
            Some((standard.to_string(), value.to_string()))
        })
        .collect()
}
