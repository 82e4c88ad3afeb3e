//! Qwen OAuth constants
//!
//! Public device-flow client configuration. None of these are secrets; the
//! access and refresh tokens live in the credential files.

use std::time::Duration;

/// Base URL of the Qwen OAuth server
pub const QWEN_OAUTH_BASE_URL: &str = "https://chat.qwen.ai";

/// Device authorization endpoint (RFC 8628 section 3.1)
pub const DEVICE_CODE_ENDPOINT: &str = "https://chat.qwen.ai/api/v1/oauth2/device/code";

/// Token endpoint for device-code polling and refresh
pub const TOKEN_ENDPOINT: &str = "https://chat.qwen.ai/api/v1/oauth2/token";

/// Public OAuth client ID used by the Qwen CLI
pub const QWEN_CLIENT_ID: &str = "f0304373b74a44d2b584a3fb70ca9e56";

pub const SCOPES: &str = "openid profile email model.completion";

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// A token is treated as expired this long before its recorded expiry.
pub const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(30);

/// Poll interval when the device authorization response omits one.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Added to the poll interval on every `slow_down` answer.
pub const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// Credential file of the default (unnamed) account.
pub const DEFAULT_CREDENTIALS_FILE: &str = "oauth_creds.json";

/// Named accounts live in `oauth_creds_<id>.json`.
pub const NAMED_CREDENTIALS_PREFIX: &str = "oauth_creds_";

/// Key used for the default account in counters and logs.
pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// OAuth server endpoints. Overridable so tests can point at a local server.
#[derive(Debug, Clone)]
pub struct OAuthEndpoints {
    pub device_code_url: String,
    pub token_url: String,
    pub client_id: String,
}

impl OAuthEndpoints {
    /// Endpoints rooted at `base_url` using the standard Qwen paths.
    pub fn with_base_url(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            device_code_url: format!("{base}/api/v1/oauth2/device/code"),
            token_url: format!("{base}/api/v1/oauth2/token"),
            client_id: QWEN_CLIENT_ID.to_string(),
        }
    }
}

impl Default for OAuthEndpoints {
    fn default() -> Self {
        Self {
            device_code_url: DEVICE_CODE_ENDPOINT.to_string(),
            token_url: TOKEN_ENDPOINT.to_string(),
            client_id: QWEN_CLIENT_ID.to_string(),
        }
    }
}
