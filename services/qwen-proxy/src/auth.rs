//! Device-flow onboarding routes

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::{Span, info, instrument, warn};

use crate::AppState;
use crate::api::new_request_id;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
struct PollRequest {
    #[serde(default)]
    device_code: String,
    #[serde(default)]
    code_verifier: String,
    /// Named account to store the credentials under; the default account
    /// when absent
    #[serde(default)]
    account_id: Option<String>,
}

#[instrument(skip_all, fields(request_id))]
pub async fn initiate(State(state): State<AppState>) -> Response {
    let request_id = new_request_id();
    Span::current().record("request_id", request_id.as_str());

    match state.tokens.initiate_device_flow().await {
        Ok(start) => {
            info!(
                verification_uri = %start.verification_uri,
                expires_in = start.expires_in,
                "device flow initiated"
            );
            Json(start).into_response()
        }
        Err(e) => {
            warn!(error = %e, "device flow initiation failed");
            ApiError::from_auth(&e, &request_id).into_response()
        }
    }
}

#[instrument(skip_all, fields(request_id, account_id))]
pub async fn poll(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    Span::current().record("request_id", request_id.as_str());

    let request: PollRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return ApiError::invalid_request(format!("invalid request body: {e}"), &request_id)
                .into_response();
        }
    };
    if request.device_code.is_empty() || request.code_verifier.is_empty() {
        return ApiError::invalid_request("Missing device_code or code_verifier", &request_id)
            .into_response();
    }
    if let Some(ref id) = request.account_id {
        Span::current().record("account_id", id.as_str());
    }

    match state
        .tokens
        .poll_for_token(
            &request.device_code,
            &request.code_verifier,
            request.account_id.as_deref(),
        )
        .await
    {
        Ok(access_token) => {
            info!("device flow completed, credentials saved");
            Json(json!({
                "access_token": access_token,
                "message": "Authentication successful",
            }))
            .into_response()
        }
        Err(e) => {
            warn!(error = %e, "device flow poll did not complete");
            ApiError::from_auth(&e, &request_id).into_response()
        }
    }
}
