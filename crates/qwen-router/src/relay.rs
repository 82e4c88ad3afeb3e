//! SSE relay with mid-stream failure handling
//!
//! Upstream chunks are forwarded as soon as they arrive. If the upstream
//! stream breaks, the failure is classified, the auth-error registry and
//! token are updated for future calls, and a single terminal SSE error
//! event ends the stream. Nothing is retried: bytes already sent to the
//! caller cannot be taken back.
//!
//! Dropping the relay (caller disconnect) drops the upstream stream and
//! with it the upstream connection.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use provider::{ByteStream, ErrorClassification, UpstreamFailure};
use qwen_auth::DEFAULT_ACCOUNT_ID;
use serde_json::json;
use tracing::{info, warn};

use crate::accounts::AccountSource;
use crate::auth_errors::AuthErrorRegistry;
use crate::classify::classify;
use crate::state::{Mode, StreamStep, on_stream_failure};
use crate::telemetry::record_upstream_error;

/// Byte stream handed to the HTTP layer. Items never fail: errors are
/// delivered in-band as SSE error events.
pub type RelayStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

pub(crate) struct RelayContext {
    pub accounts: Arc<dyn AccountSource>,
    pub auth_errors: Arc<AuthErrorRegistry>,
    /// `None` for the default account
    pub account: Option<String>,
    pub mode: Mode,
}

enum RelayState {
    Streaming {
        upstream: ByteStream,
        ctx: RelayContext,
    },
    Finished,
}

pub(crate) fn relay(upstream: ByteStream, ctx: RelayContext) -> RelayStream {
    let stream = futures_util::stream::unfold(
        RelayState::Streaming { upstream, ctx },
        |state| async move {
            let RelayState::Streaming { mut upstream, ctx } = state else {
                return None;
            };
            match upstream.next().await {
                Some(Ok(chunk)) => Some((Ok(chunk), RelayState::Streaming { upstream, ctx })),
                Some(Err(failure)) => {
                    drop(upstream);
                    let frame = handle_failure(&ctx, &failure).await;
                    Some((Ok(frame), RelayState::Finished))
                }
                None => None,
            }
        },
    );
    Box::pin(stream)
}

async fn handle_failure(ctx: &RelayContext, failure: &UpstreamFailure) -> Bytes {
    let classification = classify(failure);
    record_upstream_error(classification);
    let account_id = ctx.account.as_deref().unwrap_or(DEFAULT_ACCOUNT_ID);

    let consecutive = if classification == ErrorClassification::AuthError {
        ctx.auth_errors.increment(account_id).await
    } else {
        0
    };
    warn!(
        account_id,
        classification = classification.label(),
        consecutive,
        error = %failure,
        "upstream stream failed after it started"
    );

    match on_stream_failure(ctx.mode, classification, consecutive) {
        StreamStep::RotationRequired => sse_error_frame(
            &format!(
                "account {account_id} failed authentication {consecutive} times in a row; \
                 the next request will use another account"
            ),
            "rotation_required",
            classification.label(),
        ),
        StreamStep::RefreshForNextCall => {
            match ctx.accounts.force_refresh(ctx.account.as_deref()).await {
                Ok(_) => {
                    info!(account_id, "refreshed token after mid-stream auth error");
                    sse_error_frame(
                        "stream interrupted by an authentication error; credentials were refreshed, retry the request",
                        "authentication_error",
                        classification.label(),
                    )
                }
                Err(e) => {
                    warn!(account_id, error = %e, "token refresh after mid-stream auth error failed");
                    sse_error_frame(
                        &format!("stream interrupted by an authentication error and token refresh failed: {e}"),
                        "authentication_error",
                        classification.label(),
                    )
                }
            }
        }
        StreamStep::Terminate => sse_error_frame(
            &failure.to_string(),
            error_type(classification),
            classification.label(),
        ),
    }
}

fn error_type(classification: ErrorClassification) -> &'static str {
    match classification {
        ErrorClassification::QuotaExceeded => "quota_exceeded",
        ErrorClassification::AuthError => "authentication_error",
        ErrorClassification::Timeout => "timeout_error",
        ErrorClassification::Fatal => "api_error",
    }
}

/// `data: {"error":{...}}` followed by a blank line.
pub fn sse_error_frame(message: &str, error_type: &str, code: &str) -> Bytes {
    let body = json!({
        "error": {
            "message": message,
            "type": error_type,
            "code": code,
        }
    });
    Bytes::from(format!("data: {body}\n\n"))
}
