//! Upstream contract for the Qwen chat-completion API
//!
//! Defines the `ChatUpstream` trait that decouples account routing from the
//! HTTP client that talks to the provider. `QwenUpstream` is the reqwest
//! implementation; the router only sees `ChatUpstream`, so its retry and
//! rotation policy can be exercised with in-memory fakes.

pub mod models;
pub mod multimodal;
pub mod qwen;
pub mod rate_limit;

pub use multimodal::{ValidationError, validate_multimodal_content};
pub use qwen::{DEFAULT_API_BASE_URL, DEFAULT_MODEL, QwenUpstream, resolve_endpoint};
pub use rate_limit::extract_rate_limit_headers;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::Stream;
use serde::{Deserialize, Serialize};

/// Classification of upstream failures that drives retry and rotation.
///
/// - QuotaExceeded rotates to the next account without refreshing
/// - AuthError refreshes and retries in place, rotating on the 3rd in a row
/// - Timeout and Fatal abort the call without touching other accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    QuotaExceeded,
    AuthError,
    Timeout,
    Fatal,
}

impl ErrorClassification {
    /// Label for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorClassification::QuotaExceeded => "quota_exceeded",
            ErrorClassification::AuthError => "auth_error",
            ErrorClassification::Timeout => "timeout",
            ErrorClassification::Fatal => "fatal",
        }
    }
}

/// A failed upstream call, as observed by the client.
///
/// `status` is present when the provider answered; `message` holds the
/// response body (or the transport error text when it did not).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFailure {
    pub status: Option<u16>,
    pub message: String,
    /// No response was received (connection refused, reset, DNS)
    pub transport: bool,
    /// The local deadline elapsed before the call completed
    pub timed_out: bool,
}

impl UpstreamFailure {
    /// The provider answered with a non-success status.
    pub fn http(status: u16, body: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: body.into(),
            transport: false,
            timed_out: false,
        }
    }

    /// The request never produced a response.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            transport: true,
            timed_out: false,
        }
    }

    /// The local deadline elapsed.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            transport: true,
            timed_out: true,
        }
    }

    /// The provider answered 2xx but the body could not be used.
    pub fn malformed(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
            transport: false,
            timed_out: false,
        }
    }

    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::timeout(err.to_string());
        }
        match err.status() {
            Some(status) => Self::http(status.as_u16(), err.to_string()),
            None => Self::transport(err.to_string()),
        }
    }
}

impl fmt::Display for UpstreamFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(status) => write!(f, "Qwen API error: {status} {}", self.message),
            None if self.timed_out => write!(f, "Qwen API request timed out: {}", self.message),
            None if self.transport => write!(f, "Qwen API request failed: {}", self.message),
            None => write!(f, "Qwen API returned an unusable response: {}", self.message),
        }
    }
}

impl std::error::Error for UpstreamFailure {}

/// Inbound OpenAI-style chat-completion request.
///
/// Messages stay as raw JSON: they are forwarded verbatim, and only the
/// multimodal content blocks are inspected before dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub messages: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<serde_json::Value>,
}

impl ChatRequest {
    pub fn wants_stream(&self) -> bool {
        self.stream == Some(true)
    }
}

/// Non-streaming completion plus the provider's rate-limit headers,
/// already renamed to their standard `X-RateLimit-*` spelling.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub body: serde_json::Value,
    pub rate_limit_headers: BTreeMap<String, String>,
}

/// Where and as whom a single upstream call is made.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub account_id: String,
    pub access_token: String,
    /// Per-account endpoint from the credential file, if any
    pub resource_url: Option<String>,
}

/// Raw SSE bytes from the provider. An `Err` item means the upstream stream
/// broke after it was opened.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamFailure>> + Send>>;

/// Boxed future returned by `ChatUpstream` methods.
pub type UpstreamFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Abstraction over the provider's chat-completion API.
///
/// Uses boxed futures for dyn-compatibility (`Arc<dyn ChatUpstream>`).
pub trait ChatUpstream: Send + Sync {
    /// Non-streaming completion.
    fn chat<'a>(
        &'a self,
        request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ChatResponse, UpstreamFailure>>;

    /// Open an SSE stream. Resolves once the provider has accepted the call;
    /// failures before that point are returned here, later ones arrive as
    /// `Err` items on the stream.
    fn stream_chat<'a>(
        &'a self,
        request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ByteStream, UpstreamFailure>>;

    /// Fetch the provider's model list.
    fn list_models<'a>(
        &'a self,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<serde_json::Value, UpstreamFailure>>;
}
