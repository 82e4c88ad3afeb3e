//! Token lifecycle: device-flow onboarding, expiry checks and refresh
//!
//! `TokenManager` is the only writer of credentials after startup. Two
//! requests that both see an expired token may both refresh; the second
//! write wins and both tokens remain usable, so no refresh lock is taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_ACCOUNT_ID, OAuthEndpoints, SLOW_DOWN_INCREMENT, TOKEN_REFRESH_MARGIN};
use crate::credentials::{CredentialStore, QwenCredentials, validate_account_id};
use crate::device::{PollOutcome, poll_device_token, request_device_authorization};
use crate::error::{Error, Result};
use crate::{pkce, token};

/// Default upper bound for a single `poll_for_token` call.
pub const DEFAULT_POLL_BUDGET: Duration = Duration::from_secs(300);

/// What the user needs to complete a device flow, plus the verifier the
/// caller must hand back when polling.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFlowStart {
    pub verification_uri: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification_uri_complete: Option<String>,
    pub user_code: String,
    pub device_code: String,
    pub code_verifier: String,
    pub expires_in: u64,
    pub interval: u64,
}

struct PendingDevice {
    expires_at: Instant,
    interval: Duration,
}

pub struct TokenManager {
    store: Arc<CredentialStore>,
    client: reqwest::Client,
    endpoints: OAuthEndpoints,
    poll_budget: Duration,
    /// device_code -> expiry and current poll interval
    pending: Mutex<HashMap<String, PendingDevice>>,
}

impl TokenManager {
    pub fn new(store: Arc<CredentialStore>, client: reqwest::Client) -> Self {
        Self {
            store,
            client,
            endpoints: OAuthEndpoints::default(),
            poll_budget: DEFAULT_POLL_BUDGET,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_endpoints(mut self, endpoints: OAuthEndpoints) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_poll_budget(mut self, budget: Duration) -> Self {
        self.poll_budget = budget;
        self
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Start a device flow with a fresh PKCE verifier.
    pub async fn initiate_device_flow(&self) -> Result<DeviceFlowStart> {
        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);
        let auth = request_device_authorization(&self.client, &self.endpoints, &challenge).await?;

        self.pending.lock().await.insert(
            auth.device_code.clone(),
            PendingDevice {
                expires_at: Instant::now() + Duration::from_secs(auth.expires_in),
                interval: Duration::from_secs(auth.interval),
            },
        );
        info!(user_code = %auth.user_code, expires_in = auth.expires_in, "device flow initiated");

        Ok(DeviceFlowStart {
            verification_uri: auth.verification_uri,
            verification_uri_complete: auth.verification_uri_complete,
            user_code: auth.user_code,
            device_code: auth.device_code,
            code_verifier: verifier,
            expires_in: auth.expires_in,
            interval: auth.interval,
        })
    }

    /// Poll until the user authorizes, denies, or the device code expires.
    ///
    /// On success the credentials are persisted for `account_id` (the default
    /// account when `None`) and the access token is returned. If the per-call
    /// poll budget runs out first the result is `AuthorizationPending` and the
    /// caller may poll again with the same device code.
    pub async fn poll_for_token(
        &self,
        device_code: &str,
        code_verifier: &str,
        account_id: Option<&str>,
    ) -> Result<String> {
        if let Some(id) = account_id {
            validate_account_id(id)?;
        }

        let started = Instant::now();
        let budget_deadline = started + self.poll_budget;
        let (expires_at, mut interval) = {
            let pending = self.pending.lock().await;
            match pending.get(device_code) {
                Some(p) => (Some(p.expires_at), p.interval),
                // Initiated before a restart: only the budget bounds polling
                None => (None, Duration::from_secs(crate::constants::DEFAULT_POLL_INTERVAL_SECS)),
            }
        };

        loop {
            if expires_at.is_some_and(|at| Instant::now() >= at) {
                self.forget(device_code).await;
                return Err(Error::DeviceCodeExpired);
            }

            match poll_device_token(&self.client, &self.endpoints, device_code, code_verifier)
                .await?
            {
                PollOutcome::Authorized(token) => {
                    let creds = QwenCredentials::from_token_response(token, now_millis(), None);
                    self.store.save(account_id, &creds).await?;
                    self.forget(device_code).await;
                    info!(
                        account_id = account_id.unwrap_or(DEFAULT_ACCOUNT_ID),
                        "device flow completed"
                    );
                    return Ok(creds.access_token);
                }
                PollOutcome::Pending => {}
                PollOutcome::SlowDown => {
                    interval += SLOW_DOWN_INCREMENT;
                    self.remember_interval(device_code, interval).await;
                    debug!(interval_secs = interval.as_secs(), "device flow asked to slow down");
                }
                PollOutcome::Denied(reason) => {
                    self.forget(device_code).await;
                    return Err(Error::AuthorizationDenied(reason));
                }
                PollOutcome::Expired => {
                    self.forget(device_code).await;
                    return Err(Error::DeviceCodeExpired);
                }
            }

            let next_poll = Instant::now() + interval;
            if let Some(at) = expires_at
                && next_poll >= at
                && at <= budget_deadline
            {
                self.forget(device_code).await;
                return Err(Error::DeviceCodeExpired);
            }
            if next_poll >= budget_deadline {
                return Err(Error::AuthorizationPending);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// Whether `creds` is usable now, with the refresh margin applied.
    pub fn is_token_valid(creds: &QwenCredentials) -> bool {
        Self::is_token_valid_at(creds, now_millis())
    }

    pub fn is_token_valid_at(creds: &QwenCredentials, now_ms: u64) -> bool {
        let margin = TOKEN_REFRESH_MARGIN.as_millis() as u64;
        !creds.access_token.is_empty() && now_ms.saturating_add(margin) < creds.expiry_date
    }

    /// Credentials for `account_id`, or `NotAuthenticated` when none exist.
    pub async fn credentials(&self, account_id: Option<&str>) -> Result<QwenCredentials> {
        self.store
            .credentials_for(account_id)
            .await?
            .ok_or_else(|| Error::NotAuthenticated(account_id.unwrap_or(DEFAULT_ACCOUNT_ID).to_string()))
    }

    /// A usable access token, refreshing first if the cached one expired.
    pub async fn get_valid_access_token(&self, account_id: Option<&str>) -> Result<String> {
        Ok(self.get_valid_credentials(account_id).await?.access_token)
    }

    /// Like `get_valid_access_token` but returns the whole credential set so
    /// callers also see the refreshed `resource_url`.
    pub async fn get_valid_credentials(&self, account_id: Option<&str>) -> Result<QwenCredentials> {
        let creds = self.credentials(account_id).await?;
        if Self::is_token_valid(&creds) {
            return Ok(creds);
        }
        debug!(account_id = account_id.unwrap_or(DEFAULT_ACCOUNT_ID), "access token expired, refreshing");
        self.perform_token_refresh(&creds, account_id).await
    }

    /// Exchange the refresh token in `creds` and persist the result.
    pub async fn perform_token_refresh(
        &self,
        creds: &QwenCredentials,
        account_id: Option<&str>,
    ) -> Result<QwenCredentials> {
        let label = account_id.unwrap_or(DEFAULT_ACCOUNT_ID);
        if creds.refresh_token.is_empty() {
            return Err(Error::RefreshFailed(format!("account {label} has no refresh token")));
        }

        let token = match token::refresh_token(&self.client, &self.endpoints, &creds.refresh_token).await {
            Ok(t) => t,
            Err(e) => {
                warn!(account_id = label, error = %e, "token refresh failed");
                return Err(e);
            }
        };

        let refreshed = QwenCredentials::from_token_response(token, now_millis(), Some(creds));
        self.store.save(account_id, &refreshed).await?;
        info!(account_id = label, expiry_date = refreshed.expiry_date, "refreshed access token");
        Ok(refreshed)
    }

    async fn forget(&self, device_code: &str) {
        self.pending.lock().await.remove(device_code);
    }

    async fn remember_interval(&self, device_code: &str, interval: Duration) {
        if let Some(p) = self.pending.lock().await.get_mut(device_code) {
            p.interval = interval;
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::{Value, json};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted OAuth server: device-code answers are fixed, token answers
    /// are popped from a queue (the last one repeats).
    #[derive(Clone)]
    struct MockOAuth {
        device: Value,
        token_answers: Arc<std::sync::Mutex<VecDeque<(StatusCode, Value)>>>,
        device_polls: Arc<AtomicUsize>,
        refreshes: Arc<AtomicUsize>,
    }

    impl MockOAuth {
        fn new(answers: Vec<(StatusCode, Value)>) -> Self {
            Self {
                device: json!({
                    "device_code": "dc-1",
                    "user_code": "ABCD-EFGH",
                    "verification_uri": "https://chat.qwen.ai/authorize",
                    "expires_in": 600,
                    "interval": 0
                }),
                token_answers: Arc::new(std::sync::Mutex::new(answers.into())),
                device_polls: Arc::new(AtomicUsize::new(0)),
                refreshes: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn next_answer(&self) -> (StatusCode, Value) {
            let mut answers = self.token_answers.lock().unwrap();
            if answers.len() > 1 {
                answers.pop_front().unwrap()
            } else {
                answers.front().cloned().unwrap()
            }
        }
    }

    async fn device_code(State(mock): State<MockOAuth>) -> axum::Json<Value> {
        axum::Json(mock.device.clone())
    }

    async fn token(
        State(mock): State<MockOAuth>,
        axum::Form(form): axum::Form<HashMap<String, String>>,
    ) -> (StatusCode, axum::Json<Value>) {
        if form["grant_type"] == "refresh_token" {
            mock.refreshes.fetch_add(1, Ordering::SeqCst);
        } else {
            mock.device_polls.fetch_add(1, Ordering::SeqCst);
        }
        let (status, body) = mock.next_answer();
        (status, axum::Json(body))
    }

    async fn manager(mock: MockOAuth, dir: &std::path::Path) -> TokenManager {
        let router = Router::new()
            .route("/api/v1/oauth2/device/code", post(device_code))
            .route("/api/v1/oauth2/token", post(token))
            .with_state(mock);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

        let store = Arc::new(CredentialStore::new(dir));
        TokenManager::new(store, reqwest::Client::new())
            .with_endpoints(OAuthEndpoints::with_base_url(&format!("http://{addr}")))
    }

    fn tokens(access: &str) -> (StatusCode, Value) {
        (
            StatusCode::OK,
            json!({"access_token": access, "refresh_token": format!("rt_{access}"), "expires_in": 3600}),
        )
    }

    fn oauth_error(code: &str) -> (StatusCode, Value) {
        (StatusCode::BAD_REQUEST, json!({"error": code}))
    }

    fn expired_creds() -> QwenCredentials {
        QwenCredentials {
            access_token: "at_stale".into(),
            refresh_token: "rt_stale".into(),
            token_type: "Bearer".into(),
            resource_url: Some("portal.qwen.ai".into()),
            expiry_date: 1,
        }
    }

    #[test]
    fn validity_applies_safety_margin() {
        let mut creds = expired_creds();
        creds.expiry_date = 100_000;
        assert!(TokenManager::is_token_valid_at(&creds, 69_999));
        assert!(!TokenManager::is_token_valid_at(&creds, 70_000));
        assert!(!TokenManager::is_token_valid_at(&creds, 100_001));

        creds.access_token.clear();
        assert!(!TokenManager::is_token_valid_at(&creds, 0));
    }

    #[tokio::test]
    async fn device_flow_pending_then_success_persists_default_account() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockOAuth::new(vec![oauth_error("authorization_pending"), tokens("at_device")]);
        let tm = manager(mock.clone(), dir.path()).await;

        let start = tm.initiate_device_flow().await.unwrap();
        assert_eq!(start.user_code, "ABCD-EFGH");
        assert_eq!(start.code_verifier.len(), 43);

        let access = tm
            .poll_for_token(&start.device_code, &start.code_verifier, None)
            .await
            .unwrap();
        assert_eq!(access, "at_device");
        assert_eq!(mock.device_polls.load(Ordering::SeqCst), 2);

        let saved = tm.store().load_credentials().await.unwrap().unwrap();
        assert_eq!(saved.access_token, "at_device");
        assert_eq!(saved.refresh_token, "rt_at_device");
    }

    #[tokio::test]
    async fn device_flow_can_target_named_account() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(MockOAuth::new(vec![tokens("at_named")]), dir.path()).await;

        let start = tm.initiate_device_flow().await.unwrap();
        tm.poll_for_token(&start.device_code, &start.code_verifier, Some("work"))
            .await
            .unwrap();

        assert_eq!(tm.store().account_ids().await, vec!["work"]);
        assert!(dir.path().join("oauth_creds_work.json").exists());
    }

    #[tokio::test]
    async fn device_flow_denied_and_expired_are_typed() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(MockOAuth::new(vec![oauth_error("access_denied")]), dir.path()).await;
        let start = tm.initiate_device_flow().await.unwrap();
        let err = tm
            .poll_for_token(&start.device_code, &start.code_verifier, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationDenied(_)), "got {err:?}");

        let tm = manager(MockOAuth::new(vec![oauth_error("expired_token")]), dir.path()).await;
        let start = tm.initiate_device_flow().await.unwrap();
        let err = tm
            .poll_for_token(&start.device_code, &start.code_verifier, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceCodeExpired), "got {err:?}");
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_reports_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut mock = MockOAuth::new(vec![oauth_error("authorization_pending")]);
        mock.device["interval"] = json!(1);
        let tm = manager(mock.clone(), dir.path())
            .await
            .with_poll_budget(Duration::from_millis(200));

        let start = tm.initiate_device_flow().await.unwrap();
        let err = tm
            .poll_for_token(&start.device_code, &start.code_verifier, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AuthorizationPending), "got {err:?}");
        assert_eq!(mock.device_polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_credentials_are_not_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(MockOAuth::new(vec![tokens("unused")]), dir.path()).await;

        let err = tm.get_valid_access_token(None).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(ref id) if id == "default"));

        let err = tm.get_valid_access_token(Some("ghost")).await.unwrap_err();
        assert!(matches!(err, Error::NotAuthenticated(ref id) if id == "ghost"));
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockOAuth::new(vec![tokens("unused")]);
        let tm = manager(mock.clone(), dir.path()).await;
        let mut creds = expired_creds();
        creds.access_token = "at_fresh".into();
        creds.expiry_date = now_millis() + 3_600_000;
        tm.store().save(None, &creds).await.unwrap();

        assert_eq!(tm.get_valid_access_token(None).await.unwrap(), "at_fresh");
        assert_eq!(mock.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mock = MockOAuth::new(vec![tokens("at_refreshed")]);
        let tm = manager(mock.clone(), dir.path()).await;
        tm.store().save(Some("acct1"), &expired_creds()).await.unwrap();

        let creds = tm.get_valid_credentials(Some("acct1")).await.unwrap();
        assert_eq!(creds.access_token, "at_refreshed");
        assert_eq!(creds.resource_url.as_deref(), Some("portal.qwen.ai"));
        assert_eq!(mock.refreshes.load(Ordering::SeqCst), 1);

        let reloaded = CredentialStore::new(dir.path());
        reloaded.load_all_accounts().await.unwrap();
        let on_disk = reloaded.get_account_credentials("acct1").await.unwrap();
        assert_eq!(on_disk.access_token, "at_refreshed");
        assert!(TokenManager::is_token_valid(&on_disk));
    }

    #[tokio::test]
    async fn revoked_refresh_token_is_refresh_failed() {
        let dir = tempfile::tempdir().unwrap();
        let tm = manager(MockOAuth::new(vec![oauth_error("invalid_grant")]), dir.path()).await;
        tm.store().save(None, &expired_creds()).await.unwrap();

        let err = tm.get_valid_access_token(None).await.unwrap_err();
        assert!(matches!(err, Error::RefreshFailed(_)), "got {err:?}");
    }
}
