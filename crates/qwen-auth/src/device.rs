//! OAuth 2.0 device authorization grant (RFC 8628) with PKCE
//!
//! Single-shot protocol calls. The polling loop, deadlines and persistence
//! live in `TokenManager`.

use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};

use crate::constants::{DEFAULT_POLL_INTERVAL_SECS, DEVICE_CODE_GRANT_TYPE, OAuthEndpoints, SCOPES};
use crate::error::{Error, Result};
use crate::token::{OAuthErrorBody, TokenResponse};

/// Device authorization answer shown to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceAuthorization {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    /// Seconds until `device_code` expires
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    /// Minimum seconds between polls
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_expires_in() -> u64 {
    600
}

fn default_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

/// Result of a single poll of the token endpoint.
#[derive(Debug)]
pub enum PollOutcome {
    Authorized(TokenResponse),
    Pending,
    SlowDown,
    Denied(String),
    Expired,
}

/// Register a device authorization request for `challenge`.
pub async fn request_device_authorization(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    challenge: &str,
) -> Result<DeviceAuthorization> {
    let response = client
        .post(&endpoints.device_code_url)
        .header(ACCEPT, "application/json")
        .form(&[
            ("client_id", endpoints.client_id.as_str()),
            ("scope", SCOPES),
            ("code_challenge", challenge),
            ("code_challenge_method", "S256"),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("device authorization request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::Http(format!(
            "device authorization returned {status}: {body}"
        )));
    }

    response
        .json::<DeviceAuthorization>()
        .await
        .map_err(|e| Error::Http(format!("invalid device authorization response: {e}")))
}

/// Poll the token endpoint once for `device_code`.
///
/// Pending, slow-down, denied and expired answers are outcomes, not errors.
/// An `error` field is honored regardless of HTTP status.
pub async fn poll_device_token(
    client: &reqwest::Client,
    endpoints: &OAuthEndpoints,
    device_code: &str,
    code_verifier: &str,
) -> Result<PollOutcome> {
    let response = client
        .post(&endpoints.token_url)
        .header(ACCEPT, "application/json")
        .form(&[
            ("grant_type", DEVICE_CODE_GRANT_TYPE),
            ("client_id", endpoints.client_id.as_str()),
            ("device_code", device_code),
            ("code_verifier", code_verifier),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("device token poll failed: {e}")))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::Http(format!("reading device token response: {e}")))?;

    if let Ok(err) = serde_json::from_str::<OAuthErrorBody>(&body) {
        return match err.error.as_str() {
            "authorization_pending" => Ok(PollOutcome::Pending),
            "slow_down" => Ok(PollOutcome::SlowDown),
            "access_denied" => Ok(PollOutcome::Denied(err.describe())),
            "expired_token" => Ok(PollOutcome::Expired),
            _ => Err(Error::TokenExchange(format!(
                "device token poll returned {status}: {}",
                err.describe()
            ))),
        };
    }

    if !status.is_success() {
        return Err(Error::Http(format!(
            "device token poll returned {status}: {body}"
        )));
    }

    serde_json::from_str::<TokenResponse>(&body)
        .map(PollOutcome::Authorized)
        .map_err(|e| Error::TokenExchange(format!("invalid device token response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::json;
    use std::collections::HashMap;

    async fn spawn(router: Router) -> OAuthEndpoints {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
        OAuthEndpoints::with_base_url(&format!("http://{addr}"))
    }

    fn token_route(status: StatusCode, body: serde_json::Value) -> Router {
        Router::new().route(
            "/api/v1/oauth2/token",
            post(move || {
                let body = body.clone();
                async move { (status, axum::Json(body)) }
            }),
        )
    }

    #[test]
    fn device_authorization_defaults_interval() {
        let json = r#"{"device_code":"dc","user_code":"ABCD-1234","verification_uri":"https://chat.qwen.ai/authorize"}"#;
        let auth: DeviceAuthorization = serde_json::from_str(json).unwrap();
        assert_eq!(auth.interval, DEFAULT_POLL_INTERVAL_SECS);
        assert_eq!(auth.expires_in, 600);
    }

    #[tokio::test]
    async fn device_authorization_sends_pkce_challenge() {
        let router = Router::new().route(
            "/api/v1/oauth2/device/code",
            post(|axum::Form(form): axum::Form<HashMap<String, String>>| async move {
                assert_eq!(form["code_challenge"], "challenge-abc");
                assert_eq!(form["code_challenge_method"], "S256");
                assert_eq!(form["scope"], SCOPES);
                axum::Json(json!({
                    "device_code": "dc-1",
                    "user_code": "WXYZ-0000",
                    "verification_uri": "https://chat.qwen.ai/authorize",
                    "verification_uri_complete": "https://chat.qwen.ai/authorize?user_code=WXYZ-0000",
                    "expires_in": 900,
                    "interval": 2
                }))
            }),
        );
        let endpoints = spawn(router).await;

        let auth = request_device_authorization(&reqwest::Client::new(), &endpoints, "challenge-abc")
            .await
            .unwrap();
        assert_eq!(auth.device_code, "dc-1");
        assert_eq!(auth.user_code, "WXYZ-0000");
        assert_eq!(auth.interval, 2);
        assert_eq!(auth.expires_in, 900);
    }

    #[tokio::test]
    async fn poll_maps_rfc8628_error_codes() {
        let client = reqwest::Client::new();
        let cases = [
            ("authorization_pending", "pending"),
            ("slow_down", "slow_down"),
            ("access_denied", "denied"),
            ("expired_token", "expired"),
        ];
        for (code, expected) in cases {
            let endpoints =
                spawn(token_route(StatusCode::BAD_REQUEST, json!({"error": code}))).await;
            let outcome = poll_device_token(&client, &endpoints, "dc", "verifier")
                .await
                .unwrap();
            let got = match outcome {
                PollOutcome::Pending => "pending",
                PollOutcome::SlowDown => "slow_down",
                PollOutcome::Denied(_) => "denied",
                PollOutcome::Expired => "expired",
                PollOutcome::Authorized(_) => "authorized",
            };
            assert_eq!(got, expected, "error code {code}");
        }
    }

    #[tokio::test]
    async fn poll_returns_tokens_on_success() {
        let endpoints = spawn(token_route(
            StatusCode::OK,
            json!({"access_token": "at", "refresh_token": "rt", "expires_in": 3600, "token_type": "Bearer"}),
        ))
        .await;

        let outcome = poll_device_token(&reqwest::Client::new(), &endpoints, "dc", "v")
            .await
            .unwrap();
        match outcome {
            PollOutcome::Authorized(token) => assert_eq!(token.access_token, "at"),
            other => panic!("expected authorized, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_oauth_error_is_token_exchange() {
        let endpoints = spawn(token_route(
            StatusCode::BAD_REQUEST,
            json!({"error": "invalid_client"}),
        ))
        .await;

        let err = poll_device_token(&reqwest::Client::new(), &endpoints, "dc", "v")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)), "got {err:?}");
    }
}
