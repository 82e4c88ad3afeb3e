//! HTTP error responses
//!
//! Router and auth errors arrive already classified; this module only maps
//! them to a status code and an OpenAI style error body.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Error response sent to API clients.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub error_type: &'static str,
    pub code: Option<&'static str>,
    pub request_id: String,
}

impl ApiError {
    pub fn new(
        status: StatusCode,
        error_type: &'static str,
        message: impl Into<String>,
        request_id: &str,
    ) -> Self {
        Self {
            status,
            message: message.into(),
            error_type,
            code: None,
            request_id: request_id.to_string(),
        }
    }

    fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }

    pub fn invalid_request(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "invalid_request_error", message, request_id)
    }

    pub fn unauthorized(message: impl Into<String>, request_id: &str) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "authentication_error", message, request_id)
    }

    pub fn from_router(err: &qwen_router::Error, request_id: &str) -> Self {
        use qwen_router::Error;
        match err {
            Error::Validation(e) => Self::invalid_request(e.to_string(), request_id),
            Error::Authentication(msg) => Self::unauthorized(msg.clone(), request_id),
            Error::QuotaExceeded(msg) => {
                Self::new(StatusCode::TOO_MANY_REQUESTS, "quota_exceeded", msg.clone(), request_id)
                    .with_code("quota_exceeded")
            }
            Error::Upstream { status, body } => {
                let status = status
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .filter(|s| s.is_client_error() || s.is_server_error())
                    .unwrap_or(StatusCode::BAD_GATEWAY);
                Self::new(status, "api_error", body.clone(), request_id)
            }
            Error::Timeout(msg) => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "timeout_error", msg.clone(), request_id)
            }
            Error::AllAccountsExhausted { .. } => {
                // status and type follow the wrapped error; the message keeps the attempt count
                let mut mapped = Self::from_router(err.root(), request_id);
                mapped.message = err.to_string();
                if mapped.error_type == "quota_exceeded" {
                    mapped.code = Some("all_accounts_exhausted");
                }
                mapped
            }
        }
    }

    pub fn from_auth(err: &qwen_auth::Error, request_id: &str) -> Self {
        use qwen_auth::Error;
        let message = err.to_string();
        match err {
            Error::AuthorizationPending => {
                Self::new(StatusCode::ACCEPTED, "authorization_pending", message, request_id)
                    .with_code("authorization_pending")
            }
            Error::AuthorizationDenied(_) => {
                Self::new(StatusCode::FORBIDDEN, "authentication_error", message, request_id)
                    .with_code("access_denied")
            }
            Error::DeviceCodeExpired => {
                Self::new(StatusCode::GONE, "authentication_error", message, request_id)
                    .with_code("expired_token")
            }
            Error::InvalidAccountId(_) => Self::invalid_request(message, request_id),
            Error::Http(_) | Error::TokenExchange(_) => {
                Self::new(StatusCode::BAD_GATEWAY, "authentication_error", message, request_id)
            }
            Error::NotAuthenticated(_) | Error::RefreshFailed(_) => {
                Self::unauthorized(message, request_id)
            }
            Error::CredentialParse(_) | Error::Io(_) => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_server_error",
                message,
                request_id,
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut error = json!({
            "message": self.message,
            "type": self.error_type,
            "request_id": self.request_id,
        });
        if let Some(code) = self.code {
            error["code"] = json!(code);
        }
        crate::metrics::record_error_response(self.error_type);
        (self.status, Json(json!({ "error": error }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use provider::ValidationError;
    use qwen_router::Error;

    const RID: &str = "req_test";

    #[test]
    fn validation_maps_to_400() {
        let err = ApiError::from_router(&Error::Validation(ValidationError::InvalidImageUrl), RID);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.error_type, "invalid_request_error");
        assert!(err.message.contains("data URL"));
    }

    #[test]
    fn upstream_keeps_status_or_falls_back_to_502() {
        let err = ApiError::from_router(
            &Error::Upstream {
                status: Some(500),
                body: "boom".into(),
            },
            RID,
        );
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "boom");

        let err = ApiError::from_router(
            &Error::Upstream {
                status: None,
                body: "connection refused".into(),
            },
            RID,
        );
        assert_eq!(err.status, StatusCode::BAD_GATEWAY);
        assert_eq!(err.error_type, "api_error");
    }

    #[test]
    fn timeout_maps_to_504() {
        let err = ApiError::from_router(&Error::Timeout("deadline".into()), RID);
        assert_eq!(err.status, StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.error_type, "timeout_error");
    }

    #[test]
    fn exhausted_quota_maps_to_429() {
        let err = Error::AllAccountsExhausted {
            attempts: 3,
            last: Box::new(Error::QuotaExceeded("429".into())),
        };
        let mapped = ApiError::from_router(&err, RID);
        assert_eq!(mapped.status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(mapped.error_type, "quota_exceeded");
        assert_eq!(mapped.code, Some("all_accounts_exhausted"));
        assert!(mapped.message.contains("3 attempts"));
    }

    #[test]
    fn exhausted_auth_maps_to_401() {
        let err = Error::AllAccountsExhausted {
            attempts: 2,
            last: Box::new(Error::Authentication("refresh failed".into())),
        };
        let mapped = ApiError::from_router(&err, RID);
        assert_eq!(mapped.status, StatusCode::UNAUTHORIZED);
        assert_eq!(mapped.error_type, "authentication_error");
    }

    #[test]
    fn device_flow_states_have_distinct_statuses() {
        let pending = ApiError::from_auth(&qwen_auth::Error::AuthorizationPending, RID);
        assert_eq!(pending.status, StatusCode::ACCEPTED);
        let denied =
            ApiError::from_auth(&qwen_auth::Error::AuthorizationDenied("no".into()), RID);
        assert_eq!(denied.status, StatusCode::FORBIDDEN);
        let expired = ApiError::from_auth(&qwen_auth::Error::DeviceCodeExpired, RID);
        assert_eq!(expired.status, StatusCode::GONE);
    }

    #[test]
    fn local_credential_failures_are_500() {
        let err = ApiError::from_auth(&qwen_auth::Error::CredentialParse("bad json".into()), RID);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        let err = ApiError::from_auth(&qwen_auth::Error::Io("disk full".into()), RID);
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.error_type, "internal_server_error");
    }

    #[tokio::test]
    async fn body_carries_request_id_and_code() {
        let response = ApiError::from_router(&Error::QuotaExceeded("429".into()), "req_abc")
            .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["request_id"], "req_abc");
        assert_eq!(json["error"]["code"], "quota_exceeded");
        assert_eq!(json["error"]["type"], "quota_exceeded");
    }
}
