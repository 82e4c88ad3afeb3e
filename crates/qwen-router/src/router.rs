//! Multi-account dispatch with sticky selection and failover
//!
//! Each call starts at the configured default account and walks the
//! rotation order at most once. Quota errors rotate immediately; auth
//! errors refresh and retry the same account until its third consecutive
//! failure; timeouts and fatal errors abort without touching other accounts.
//! The policy itself lives in `state`; this module performs the I/O.

use std::sync::Arc;

use provider::{
    ByteStream, ChatRequest, ChatResponse, ChatUpstream, ErrorClassification, UpstreamFailure,
    UpstreamFuture, UpstreamTarget, validate_multimodal_content,
};
use qwen_auth::DEFAULT_ACCOUNT_ID;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::accounts::AccountSource;
use crate::auth_errors::AuthErrorRegistry;
use crate::classify::classify;
use crate::counter::RequestCounter;
use crate::error::{Error, Result};
use crate::relay::{RelayContext, RelayStream, relay};
use crate::state::{Cursor, Mode, Step, on_failure};
use crate::telemetry::{record_rotation, record_upstream_error};

/// One kind of upstream call, so streaming and non-streaming share the
/// dispatch loop.
trait Call: Sync {
    type Output: Send;

    fn request(&self) -> &ChatRequest;

    fn invoke<'a>(
        &'a self,
        upstream: &'a dyn ChatUpstream,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, std::result::Result<Self::Output, UpstreamFailure>>;
}

struct Complete<'r>(&'r ChatRequest);

impl Call for Complete<'_> {
    type Output = ChatResponse;

    fn request(&self) -> &ChatRequest {
        self.0
    }

    fn invoke<'a>(
        &'a self,
        upstream: &'a dyn ChatUpstream,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, std::result::Result<ChatResponse, UpstreamFailure>> {
        upstream.chat(self.0, target)
    }
}

struct OpenStream<'r>(&'r ChatRequest);

impl Call for OpenStream<'_> {
    type Output = ByteStream;

    fn request(&self) -> &ChatRequest {
        self.0
    }

    fn invoke<'a>(
        &'a self,
        upstream: &'a dyn ChatUpstream,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, std::result::Result<ByteStream, UpstreamFailure>> {
        upstream.stream_chat(self.0, target)
    }
}

/// A successful dispatch and the account that served it.
struct Landed<T> {
    output: T,
    /// `None` for the default account
    account: Option<String>,
    mode: Mode,
}

/// Per-account view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct AccountUsage {
    pub id: String,
    pub requests_today: u64,
    pub consecutive_auth_errors: u32,
}

pub struct AccountRouter {
    accounts: Arc<dyn AccountSource>,
    upstream: Arc<dyn ChatUpstream>,
    counter: Arc<RequestCounter>,
    auth_errors: Arc<AuthErrorRegistry>,
    default_account: Option<String>,
}

impl AccountRouter {
    pub fn new(
        accounts: Arc<dyn AccountSource>,
        upstream: Arc<dyn ChatUpstream>,
        counter: Arc<RequestCounter>,
    ) -> Self {
        Self {
            accounts,
            upstream,
            counter,
            auth_errors: Arc::new(AuthErrorRegistry::new()),
            default_account: None,
        }
    }

    /// Named account each call starts from. Ignored if no such account exists.
    pub fn with_default_account(mut self, account: Option<String>) -> Self {
        self.default_account = account;
        self
    }

    pub fn counter(&self) -> &Arc<RequestCounter> {
        &self.counter
    }

    pub fn auth_errors(&self) -> &Arc<AuthErrorRegistry> {
        &self.auth_errors
    }

    /// Non-streaming completion.
    pub async fn chat_completions(&self, request: &ChatRequest) -> Result<ChatResponse> {
        let landed = self.dispatch(&Complete(request)).await?;
        Ok(landed.output)
    }

    /// Open a relayed SSE stream. Failures before the stream is established
    /// go through the same rotation rules as non-streaming calls; failures
    /// after that end the stream with an error event.
    pub async fn stream_chat_completions(&self, request: &ChatRequest) -> Result<RelayStream> {
        let landed = self.dispatch(&OpenStream(request)).await?;
        debug!(
            account_id = landed.account.as_deref().unwrap_or(DEFAULT_ACCOUNT_ID),
            "upstream stream established"
        );
        Ok(relay(
            landed.output,
            RelayContext {
                accounts: self.accounts.clone(),
                auth_errors: self.auth_errors.clone(),
                account: landed.account,
                mode: landed.mode,
            },
        ))
    }

    /// Provider model list, or the built-in catalogue when it cannot be
    /// fetched.
    pub async fn list_models(&self) -> serde_json::Value {
        let ids = self.accounts.refresh_accounts().await;
        let account = self
            .default_account
            .as_deref()
            .filter(|d| ids.iter().any(|id| id == d))
            .or_else(|| ids.first().map(String::as_str));

        let target = match self.accounts.target(account).await {
            Ok(t) => t,
            Err(e) => {
                debug!(error = %e, "no usable account for models list, serving built-in catalogue");
                return provider::models::fallback_models();
            }
        };
        match self.upstream.list_models(&target).await {
            Ok(models) => models,
            Err(e) => {
                debug!(error = %e, "models endpoint unavailable, serving built-in catalogue");
                provider::models::fallback_models()
            }
        }
    }

    /// Today's counts and auth-error streaks for every known account.
    pub async fn usage(&self) -> Vec<AccountUsage> {
        let mut ids = self.accounts.refresh_accounts().await;
        if ids.is_empty() {
            ids.push(DEFAULT_ACCOUNT_ID.to_string());
        }
        let mut usage = Vec::with_capacity(ids.len());
        for id in ids {
            usage.push(AccountUsage {
                requests_today: self.counter.get(&id).await,
                consecutive_auth_errors: self.auth_errors.get(&id).await,
                id,
            });
        }
        usage
    }

    async fn dispatch<C: Call>(&self, call: &C) -> Result<Landed<C::Output>> {
        validate_multimodal_content(&call.request().messages)?;

        let ids = self.accounts.refresh_accounts().await;
        if ids.is_empty() {
            return self.dispatch_single(call).await;
        }

        let start = self
            .default_account
            .as_deref()
            .and_then(|d| ids.iter().position(|id| id == d))
            .unwrap_or(0);
        let mut cursor = Cursor::new(ids.len(), start);
        let mut last: Option<Error> = None;

        while let Some(index) = cursor.next_iteration() {
            let id = ids[index].as_str();

            let target = match self.accounts.target(Some(id)).await {
                Ok(t) => t,
                Err(qwen_auth::Error::NotAuthenticated(_)) => {
                    debug!(account_id = id, "account has no credentials, skipping");
                    cursor.advance();
                    continue;
                }
                Err(e) => {
                    warn!(account_id = id, error = %e, "could not obtain token, skipping account");
                    last = Some(Error::from_auth(e));
                    cursor.advance();
                    continue;
                }
            };

            let requests_today = self.counter.increment(id).await;
            debug!(account_id = id, requests_today, "dispatching to account");

            let failure = match call.invoke(&*self.upstream, &target).await {
                Ok(output) => {
                    self.auth_errors.reset(id).await;
                    return Ok(Landed {
                        output,
                        account: Some(id.to_string()),
                        mode: Mode::Multi,
                    });
                }
                Err(f) => f,
            };

            let classification = classify(&failure);
            record_upstream_error(classification);
            let consecutive = self.note_auth_error(id, classification).await;
            let err = Error::from_failure(classification, &failure);

            match on_failure(Mode::Multi, classification, consecutive) {
                Step::Rotate(reason) => {
                    warn!(
                        account_id = id,
                        reason = reason.label(),
                        consecutive,
                        "rotating to next account"
                    );
                    record_rotation(reason);
                    cursor.advance();
                    last = Some(err);
                }
                Step::RefreshAndRetry => {
                    info!(account_id = id, consecutive, "auth error, refreshing token and retrying");
                    match self.retry_after_refresh(call, Some(id)).await {
                        Ok(output) => {
                            self.auth_errors.reset(id).await;
                            info!(account_id = id, "request succeeded after token refresh");
                            return Ok(Landed {
                                output,
                                account: Some(id.to_string()),
                                mode: Mode::Multi,
                            });
                        }
                        Err(retry_err) => {
                            warn!(account_id = id, error = %retry_err, "retry after refresh failed");
                            last = Some(retry_err);
                        }
                    }
                }
                Step::Abort => {
                    warn!(
                        account_id = id,
                        classification = classification.label(),
                        error = %failure,
                        "upstream call failed"
                    );
                    return Err(err);
                }
            }
        }

        let last = last.unwrap_or_else(|| {
            Error::Authentication("no account has usable credentials".to_string())
        });
        warn!(attempts = cursor.iterations(), last_error = %last, "all accounts exhausted");
        Err(Error::AllAccountsExhausted {
            attempts: cursor.iterations(),
            last: Box::new(last),
        })
    }

    /// Only the default account: one attempt and at most one refresh+retry.
    async fn dispatch_single<C: Call>(&self, call: &C) -> Result<Landed<C::Output>> {
        let target = self
            .accounts
            .target(None)
            .await
            .map_err(Error::from_auth)?;
        self.counter.increment(DEFAULT_ACCOUNT_ID).await;

        let failure = match call.invoke(&*self.upstream, &target).await {
            Ok(output) => {
                self.auth_errors.reset(DEFAULT_ACCOUNT_ID).await;
                return Ok(Landed {
                    output,
                    account: None,
                    mode: Mode::Single,
                });
            }
            Err(f) => f,
        };

        let classification = classify(&failure);
        record_upstream_error(classification);
        let consecutive = self.note_auth_error(DEFAULT_ACCOUNT_ID, classification).await;

        match on_failure(Mode::Single, classification, consecutive) {
            Step::RefreshAndRetry => {
                info!(consecutive, "auth error on default account, refreshing token and retrying");
                let output = self.retry_after_refresh(call, None).await?;
                self.auth_errors.reset(DEFAULT_ACCOUNT_ID).await;
                Ok(Landed {
                    output,
                    account: None,
                    mode: Mode::Single,
                })
            }
            Step::Rotate(_) | Step::Abort => {
                let err = Error::from_failure(classification, &failure);
                warn!(
                    classification = classification.label(),
                    error = %failure,
                    "upstream call failed"
                );
                if classification == ErrorClassification::QuotaExceeded {
                    return Err(Error::AllAccountsExhausted {
                        attempts: 1,
                        last: Box::new(err),
                    });
                }
                Err(err)
            }
        }
    }

    /// Force a refresh for `account` and repeat the call once. Does not
    /// count another request.
    async fn retry_after_refresh<C: Call>(
        &self,
        call: &C,
        account: Option<&str>,
    ) -> Result<C::Output> {
        let target = self
            .accounts
            .force_refresh(account)
            .await
            .map_err(Error::from_auth)?;
        call.invoke(&*self.upstream, &target).await.map_err(|f| {
            let classification = classify(&f);
            record_upstream_error(classification);
            Error::from_failure(classification, &f)
        })
    }

    async fn note_auth_error(&self, account_id: &str, classification: ErrorClassification) -> u32 {
        if classification == ErrorClassification::AuthError {
            self.auth_errors.increment(account_id).await
        } else {
            0
        }
    }
}
