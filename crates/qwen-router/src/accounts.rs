//! Account source seam between the router and the token lifecycle
//!
//! `TokenManager` is the production source. Router tests substitute fakes
//! that count refreshes without any OAuth server.

use provider::{UpstreamFuture, UpstreamTarget};
use qwen_auth::{DEFAULT_ACCOUNT_ID, QwenCredentials, TokenManager};
use tracing::warn;

/// Supplies account ids and ready-to-use upstream targets.
///
/// `account = None` is the default (unnamed) account.
pub trait AccountSource: Send + Sync {
    /// Rescan persisted accounts and return named ids in rotation order.
    fn refresh_accounts(&self) -> UpstreamFuture<'_, Vec<String>>;

    /// Target with a valid token, refreshing first if the cached one expired.
    /// `NotAuthenticated` means the account has no credentials at all.
    fn target<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>>;

    /// Refresh unconditionally and return the new target.
    fn force_refresh<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>>;
}

fn to_target(account: Option<&str>, creds: QwenCredentials) -> UpstreamTarget {
    UpstreamTarget {
        account_id: account.unwrap_or(DEFAULT_ACCOUNT_ID).to_string(),
        access_token: creds.access_token,
        resource_url: creds.resource_url,
    }
}

impl AccountSource for TokenManager {
    fn refresh_accounts(&self) -> UpstreamFuture<'_, Vec<String>> {
        Box::pin(async move {
            if let Err(e) = self.store().load_all_accounts().await {
                warn!(error = %e, "failed to rescan credential files, keeping previous accounts");
            }
            self.store().account_ids().await
        })
    }

    fn target<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>> {
        Box::pin(async move {
            let creds = self.get_valid_credentials(account).await?;
            Ok(to_target(account, creds))
        })
    }

    fn force_refresh<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>> {
        Box::pin(async move {
            let creds = self.credentials(account).await?;
            let refreshed = self.perform_token_refresh(&creds, account).await?;
            Ok(to_target(account, refreshed))
        })
    }
}
