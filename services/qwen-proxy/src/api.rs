//! OpenAI-compatible routes
//!
//! Parses the inbound body, hands it to the account router, and shapes the
//! result: JSON plus rate-limit headers for regular completions, an SSE body
//! for streams.

use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::header::{AUTHORIZATION, CACHE_CONTROL, CONTENT_TYPE};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use provider::ChatRequest;
use tracing::{Span, debug, info, instrument, warn};

use crate::AppState;
use crate::error::ApiError;
use crate::metrics;

pub const CHAT_ROUTE: &str = "/v1/chat/completions";
pub const MODELS_ROUTE: &str = "/v1/models";

pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Reject requests without the configured bearer key. A no-op when no key
/// is configured.
pub async fn require_api_key(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.api_key.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match presented {
        Some(key) if expected.matches(key) => next.run(request).await,
        Some(_) => {
            warn!(path = %request.uri().path(), "rejected request with invalid API key");
            ApiError::unauthorized("Invalid API key", &new_request_id()).into_response()
        }
        None => ApiError::unauthorized("Missing or invalid authorization header", &new_request_id())
            .into_response(),
    }
}

#[instrument(skip_all, fields(request_id))]
pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> Response {
    let request_id = new_request_id();
    Span::current().record("request_id", request_id.as_str());
    let started = Instant::now();

    let mut request: ChatRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            let response =
                ApiError::invalid_request(format!("invalid request body: {e}"), &request_id)
                    .into_response();
            metrics::record_request(response.status().as_u16(), CHAT_ROUTE, started.elapsed().as_secs_f64());
            return response;
        }
    };

    let streaming = request.wants_stream() && state.stream_enabled;
    if request.wants_stream() && !streaming {
        debug!("streaming disabled, answering with a regular completion");
        request.stream = Some(false);
    }
    info!(
        messages = request.messages.len(),
        model = request.model.as_deref().unwrap_or("default"),
        streaming,
        "chat completion request"
    );

    let response = if streaming {
        stream_response(&state, &request, &request_id).await
    } else {
        complete_response(&state, &request, &request_id).await
    };
    metrics::record_request(response.status().as_u16(), CHAT_ROUTE, started.elapsed().as_secs_f64());
    response
}

async fn complete_response(state: &AppState, request: &ChatRequest, request_id: &str) -> Response {
    match state.router.chat_completions(request).await {
        Ok(completion) => {
            if let Some(usage) = completion.body.get("usage") {
                info!(
                    prompt_tokens = usage.get("prompt_tokens").and_then(|v| v.as_u64()),
                    completion_tokens = usage.get("completion_tokens").and_then(|v| v.as_u64()),
                    total_tokens = usage.get("total_tokens").and_then(|v| v.as_u64()),
                    "chat completion succeeded"
                );
            }
            let mut response = Json(completion.body).into_response();
            let headers = response.headers_mut();
            for (name, value) in &completion.rate_limit_headers {
                if let (Ok(name), Ok(value)) = (
                    HeaderName::from_bytes(name.as_bytes()),
                    HeaderValue::from_str(value),
                ) {
                    headers.insert(name, value);
                }
            }
            response
        }
        Err(e) => {
            warn!(error = %e, "chat completion failed");
            ApiError::from_router(&e, request_id).into_response()
        }
    }
}

async fn stream_response(state: &AppState, request: &ChatRequest, request_id: &str) -> Response {
    match state.router.stream_chat_completions(request).await {
        Ok(stream) => {
            info!("streaming chat completion started");
            let mut response = Response::new(Body::from_stream(stream));
            *response.status_mut() = StatusCode::OK;
            let headers = response.headers_mut();
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
            headers.insert(CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            response
        }
        Err(e) => {
            warn!(error = %e, "streaming chat completion failed before the first byte");
            ApiError::from_router(&e, request_id).into_response()
        }
    }
}

#[instrument(skip_all)]
pub async fn list_models(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let models = state.router.list_models().await;
    metrics::record_request(200, MODELS_ROUTE, started.elapsed().as_secs_f64());
    Json(models).into_response()
}
