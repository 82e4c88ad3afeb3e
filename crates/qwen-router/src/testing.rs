//! In-memory account source and upstream for router and relay tests

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use provider::{
    ByteStream, ChatRequest, ChatResponse, ChatUpstream, UpstreamFailure, UpstreamFuture,
    UpstreamTarget,
};
use qwen_auth::DEFAULT_ACCOUNT_ID;
use serde_json::{Value, json};

use crate::accounts::AccountSource;

pub(crate) struct FakeAccounts {
    ids: Vec<String>,
    missing: HashSet<String>,
    broken_tokens: HashSet<String>,
    default_present: bool,
    refresh_fails: bool,
    refreshes: AtomicUsize,
    generation: AtomicUsize,
}

impl FakeAccounts {
    /// Only the default account, with credentials.
    pub fn single() -> Self {
        Self::named(&[])
    }

    pub fn named(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|s| s.to_string()).collect(),
            missing: HashSet::new(),
            broken_tokens: HashSet::new(),
            default_present: true,
            refresh_fails: false,
            refreshes: AtomicUsize::new(0),
            generation: AtomicUsize::new(0),
        }
    }

    pub fn failing_refresh(mut self) -> Self {
        self.refresh_fails = true;
        self
    }

    pub fn without_credentials(mut self, id: &str) -> Self {
        self.missing.insert(id.to_string());
        self
    }

    /// `target` for `id` fails as if its expired token could not be refreshed.
    pub fn failing_token(mut self, id: &str) -> Self {
        self.broken_tokens.insert(id.to_string());
        self
    }

    pub fn without_default(mut self) -> Self {
        self.default_present = false;
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    fn present(&self, account: Option<&str>) -> qwen_auth::Result<String> {
        let id = account.unwrap_or(DEFAULT_ACCOUNT_ID);
        let present = match account {
            None => self.default_present,
            Some(id) => self.ids.iter().any(|i| i == id) && !self.missing.contains(id),
        };
        if present {
            Ok(id.to_string())
        } else {
            Err(qwen_auth::Error::NotAuthenticated(id.to_string()))
        }
    }

    fn target_for(&self, id: String) -> UpstreamTarget {
        let generation = self.generation.load(Ordering::SeqCst);
        UpstreamTarget {
            access_token: format!("tok-{id}-{generation}"),
            account_id: id,
            resource_url: None,
        }
    }
}

impl AccountSource for FakeAccounts {
    fn refresh_accounts(&self) -> UpstreamFuture<'_, Vec<String>> {
        Box::pin(async move { self.ids.clone() })
    }

    fn target<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>> {
        Box::pin(async move {
            let id = self.present(account)?;
            if self.broken_tokens.contains(&id) {
                return Err(qwen_auth::Error::RefreshFailed(format!("refresh token for {id} revoked")));
            }
            Ok(self.target_for(id))
        })
    }

    fn force_refresh<'a>(
        &'a self,
        account: Option<&'a str>,
    ) -> UpstreamFuture<'a, qwen_auth::Result<UpstreamTarget>> {
        Box::pin(async move {
            let id = self.present(account)?;
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if self.refresh_fails {
                return Err(qwen_auth::Error::RefreshFailed("refresh token revoked".into()));
            }
            self.generation.fetch_add(1, Ordering::SeqCst);
            Ok(self.target_for(id))
        })
    }
}

type Script = Box<dyn Fn(&str, usize) -> Result<(), UpstreamFailure> + Send + Sync>;

/// Upstream whose outcome is decided by `script(account_id, nth_call_for_account)`.
pub(crate) struct FakeUpstream {
    script: Script,
    calls: Mutex<Vec<String>>,
    stream_items: Mutex<Vec<Result<Bytes, UpstreamFailure>>>,
    models: Option<Value>,
}

impl FakeUpstream {
    pub fn new(
        script: impl Fn(&str, usize) -> Result<(), UpstreamFailure> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            calls: Mutex::new(Vec::new()),
            stream_items: Mutex::new(Vec::new()),
            models: None,
        }
    }

    pub fn ok() -> Self {
        Self::new(|_, _| Ok(()))
    }

    pub fn with_stream(self, items: Vec<Result<Bytes, UpstreamFailure>>) -> Self {
        *self.stream_items.lock().unwrap() = items;
        self
    }

    pub fn with_models(mut self, models: Value) -> Self {
        self.models = Some(models);
        self
    }

    /// Account ids in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, account_id: &str) -> usize {
        let mut calls = self.calls.lock().unwrap();
        let nth = calls.iter().filter(|c| c.as_str() == account_id).count();
        calls.push(account_id.to_string());
        nth
    }
}

impl ChatUpstream for FakeUpstream {
    fn chat<'a>(
        &'a self,
        _request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ChatResponse, UpstreamFailure>> {
        Box::pin(async move {
            let nth = self.record(&target.account_id);
            (self.script)(&target.account_id, nth)?;
            let mut rate_limit_headers = BTreeMap::new();
            rate_limit_headers.insert("X-RateLimit-Remaining-Requests".to_string(), "99".to_string());
            Ok(ChatResponse {
                body: json!({"account": target.account_id, "token": target.access_token}),
                rate_limit_headers,
            })
        })
    }

    fn stream_chat<'a>(
        &'a self,
        _request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ByteStream, UpstreamFailure>> {
        Box::pin(async move {
            let nth = self.record(&target.account_id);
            (self.script)(&target.account_id, nth)?;
            let items = std::mem::take(&mut *self.stream_items.lock().unwrap());
            Ok(Box::pin(futures_util::stream::iter(items)) as ByteStream)
        })
    }

    fn list_models<'a>(
        &'a self,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<Value, UpstreamFailure>> {
        Box::pin(async move {
            self.record(&target.account_id);
            self.models
                .clone()
                .ok_or_else(|| UpstreamFailure::http(404, "not found"))
        })
    }
}
