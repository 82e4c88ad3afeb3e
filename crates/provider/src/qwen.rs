//! reqwest client for the Qwen OpenAI-compatible endpoint

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::{
    ByteStream, ChatRequest, ChatResponse, ChatUpstream, UpstreamFailure, UpstreamFuture,
    UpstreamTarget, extract_rate_limit_headers,
};

/// Used when the credential file carries no `resource_url`.
pub const DEFAULT_API_BASE_URL: &str = "https://dashscope.aliyuncs.com/compatible-mode/v1";

/// Used when the caller does not name a model.
pub const DEFAULT_MODEL: &str = "qwen3-coder-plus";

const CLIENT_USER_AGENT: &str = "QwenOpenAIProxy/1.0.0 (linux; x64)";

const MODELS_TIMEOUT: Duration = Duration::from_secs(10);

/// Normalize a credential's `resource_url` into an API base URL.
///
/// A missing scheme becomes `https://` and a missing `/v1` suffix is
/// appended. `None` yields the DashScope default.
pub fn resolve_endpoint(resource_url: Option<&str>) -> String {
    let Some(raw) = resource_url.map(str::trim).filter(|s| !s.is_empty()) else {
        return DEFAULT_API_BASE_URL.to_string();
    };

    let with_scheme = if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("https://{raw}")
    };

    let base = with_scheme.trim_end_matches('/');
    if base.ends_with("/v1") {
        base.to_string()
    } else {
        format!("{base}/v1")
    }
}

/// `ChatUpstream` backed by a shared reqwest client.
pub struct QwenUpstream {
    client: reqwest::Client,
    timeout: Duration,
    default_model: String,
}

impl QwenUpstream {
    /// `timeout` bounds every chat call, streaming calls included.
    pub fn new(client: reqwest::Client, timeout: Duration, default_model: impl Into<String>) -> Self {
        Self {
            client,
            timeout,
            default_model: default_model.into(),
        }
    }

    fn build_payload(&self, request: &ChatRequest, stream: bool) -> Value {
        let mut payload = Map::new();
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.default_model.clone());
        payload.insert("model".into(), Value::String(model));
        payload.insert("messages".into(), Value::Array(request.messages.clone()));

        if let Some(t) = request.temperature {
            payload.insert("temperature".into(), json!(t));
        }
        if let Some(m) = request.max_tokens {
            payload.insert("max_tokens".into(), json!(m));
        }
        if let Some(p) = request.top_p {
            payload.insert("top_p".into(), json!(p));
        }
        if let Some(tools) = &request.tools {
            payload.insert("tools".into(), tools.clone());
        }
        if let Some(choice) = &request.tool_choice {
            payload.insert("tool_choice".into(), choice.clone());
        }

        if stream {
            let mut options = Map::new();
            options.insert("include_usage".into(), Value::Bool(true));
            if let Some(Value::Object(caller)) = &request.stream_options {
                for (k, v) in caller {
                    options.insert(k.clone(), v.clone());
                }
            }
            payload.insert("stream".into(), Value::Bool(true));
            payload.insert("stream_options".into(), Value::Object(options));
        }

        Value::Object(payload)
    }

    async fn post_completion(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
        stream: bool,
    ) -> Result<reqwest::Response, UpstreamFailure> {
        let url = format!(
            "{}/chat/completions",
            resolve_endpoint(target.resource_url.as_deref())
        );
        let payload = self.build_payload(request, stream);

        let mut builder = self
            .client
            .post(&url)
            .header(AUTHORIZATION, format!("Bearer {}", target.access_token))
            .header(USER_AGENT, CLIENT_USER_AGENT)
            .timeout(self.timeout)
            .json(&payload);
        if stream {
            builder = builder.header(ACCEPT, "text/event-stream");
        }

        debug!(account_id = %target.account_id, url = %url, stream, "dispatching upstream request");
        let response = builder
            .send()
            .await
            .map_err(|e| UpstreamFailure::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpstreamFailure::http(status.as_u16(), body));
        }
        Ok(response)
    }
}

impl ChatUpstream for QwenUpstream {
    fn chat<'a>(
        &'a self,
        request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ChatResponse, UpstreamFailure>> {
        Box::pin(async move {
            let response = self.post_completion(request, target, false).await?;
            let rate_limit_headers = extract_rate_limit_headers(response.headers());
            let body = response.json::<Value>().await.map_err(|e| {
                if e.is_timeout() {
                    UpstreamFailure::from_reqwest(&e)
                } else {
                    UpstreamFailure::malformed(e.to_string())
                }
            })?;
            Ok(ChatResponse {
                body,
                rate_limit_headers,
            })
        })
    }

    fn stream_chat<'a>(
        &'a self,
        request: &'a ChatRequest,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<ByteStream, UpstreamFailure>> {
        Box::pin(async move {
            let response = self.post_completion(request, target, true).await?;
            let stream = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| UpstreamFailure::from_reqwest(&e)));
            Ok(Box::pin(stream) as ByteStream)
        })
    }

    fn list_models<'a>(
        &'a self,
        target: &'a UpstreamTarget,
    ) -> UpstreamFuture<'a, Result<Value, UpstreamFailure>> {
        Box::pin(async move {
            let url = format!("{}/models", resolve_endpoint(target.resource_url.as_deref()));
            let response = self
                .client
                .get(&url)
                .header(AUTHORIZATION, format!("Bearer {}", target.access_token))
                .header(USER_AGENT, CLIENT_USER_AGENT)
                .timeout(MODELS_TIMEOUT)
                .send()
                .await
                .map_err(|e| UpstreamFailure::from_reqwest(&e))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(UpstreamFailure::http(status.as_u16(), body));
            }
            response
                .json::<Value>()
                .await
                .map_err(|e| UpstreamFailure::malformed(e.to_string()))
        })
    }
}
