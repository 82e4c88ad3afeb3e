//! Token endpoint interactions shared by the device flow and refresh
//!
//! Both POST form bodies to the same token endpoint with different grant
//! types. Error answers follow RFC 6749 section 5.2 (`{"error": ...}`).

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::OAuthEndpoints;
use crate::error::{Error, Result};

/// Successful token endpoint answer.
///
/// `expires_in` is a delta in seconds; callers convert it to an absolute
/// unix-millisecond `expiry_date` when storing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent on some refresh answers; the previous refresh token stays valid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    pub expires_in: u64,
    /// Per-account API host assigned by the provider
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
}

/// RFC 6749 error body.
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorBody {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl OAuthErrorBody {
    pub(crate) fn describe(&self) -> String {
        match &self.error_description {
            Some(desc) => format!("{}: {desc}", self.error),
            None => self.error.clone(),
        }
    }
}

/// Exchange a refresh token for a new access token.
///
/// 400, 401 and 403 mean the refresh token is invalid or revoked and map to
/// `Error::RefreshFailed`; the account needs a new device flow.
pub async fn refresh_token(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    refresh: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(&endpoints.token_url)
        .header(ACCEPT, "application/json")
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh),
            ("client_id", endpoints.client_id.as_str()),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        debug!(status = status.as_u16(), "token refresh rejected");

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::RefreshFailed(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }
        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid refresh response: {e}")))
}
