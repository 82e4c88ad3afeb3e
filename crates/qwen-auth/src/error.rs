//! Error types for Qwen OAuth operations

/// Errors from device flow, token refresh and credential storage.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The OAuth server could not be reached or answered unexpectedly
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("authorization pending: the user has not completed the device flow yet")]
    AuthorizationPending,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("device code expired, start a new device flow")]
    DeviceCodeExpired,

    #[error("not authenticated: no credentials for account {0}")]
    NotAuthenticated(String),

    /// The refresh token itself was rejected; re-authentication is required
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("invalid account id: {0:?}")]
    InvalidAccountId(String),

    #[error("credential parse error: {0}")]
    CredentialParse(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
