//! Gateway error taxonomy
//!
//! Every failure that leaves the router is one of these, already classified.
//! The HTTP layer maps them to status codes without further interpretation.

use provider::{ErrorClassification, UpstreamFailure, ValidationError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Malformed request content, rejected before any account is used
    #[error("{0}")]
    Validation(#[from] ValidationError),

    /// No credentials, or the token could not be refreshed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Only surfaced wrapped in `AllAccountsExhausted`
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Non-auth provider failure; status and body preserved where known
    #[error("upstream error: {body}")]
    Upstream { status: Option<u16>, body: String },

    #[error("upstream request timed out: {0}")]
    Timeout(String),

    #[error("all accounts failed after {attempts} attempts, last error: {last}")]
    AllAccountsExhausted { attempts: usize, last: Box<Error> },
}

impl Error {
    /// Build the gateway error for a classified upstream failure.
    pub fn from_failure(classification: ErrorClassification, failure: &UpstreamFailure) -> Self {
        match classification {
            ErrorClassification::QuotaExceeded => Error::QuotaExceeded(failure.to_string()),
            ErrorClassification::AuthError => Error::Authentication(failure.to_string()),
            ErrorClassification::Timeout => Error::Timeout(failure.to_string()),
            ErrorClassification::Fatal => Error::Upstream {
                status: failure.status,
                body: failure.message.clone(),
            },
        }
    }

    /// Build the gateway error for a credential or refresh failure.
    pub fn from_auth(err: qwen_auth::Error) -> Self {
        match err {
            qwen_auth::Error::Http(msg) => Error::Upstream {
                status: None,
                body: msg,
            },
            other => Error::Authentication(other.to_string()),
        }
    }

    /// The innermost error, looking through `AllAccountsExhausted`.
    pub fn root(&self) -> &Error {
        match self {
            Error::AllAccountsExhausted { last, .. } => last.root(),
            other => other,
        }
    }
}

/// Result alias for router operations.
pub type Result<T> = std::result::Result<T, Error>;
