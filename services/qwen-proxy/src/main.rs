//! Qwen OpenAI Proxy
//!
//! Single-binary Rust service that:
//! 1. Loads Qwen OAuth credentials for one or more accounts
//! 2. Serves OpenAI-compatible chat completion and model routes
//! 3. Rotates across accounts on quota and repeated auth errors
//! 4. Onboards new accounts through the OAuth device flow

mod api;
mod auth;
mod config;
mod error;
mod metrics;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{DefaultBodyLimit, State};
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use common::Secret;
use metrics_exporter_prometheus::PrometheusHandle;
use provider::QwenUpstream;
use qwen_auth::{CredentialStore, DEFAULT_ACCOUNT_ID, TokenManager};
use qwen_router::{AccountRouter, RequestCounter};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_COUNTS_FILE: &str = "request_counts.json";

/// Shared application state accessible from all handlers
#[derive(Clone)]
pub(crate) struct AppState {
    router: Arc<AccountRouter>,
    tokens: Arc<TokenManager>,
    api_key: Option<Arc<Secret<String>>>,
    stream_enabled: bool,
    prometheus: PrometheusHandle,
    started_at: Instant,
}

/// Build the axum router with all routes and shared state.
fn build_router(state: AppState, max_connections: usize, body_limit: usize) -> Router {
    let api = Router::new()
        .route(api::CHAT_ROUTE, post(api::chat_completions))
        .route(api::MODELS_ROUTE, get(api::list_models))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            api::require_api_key,
        ));

    Router::new()
        .merge(api)
        .route("/auth/initiate", post(auth::initiate))
        .route("/auth/poll", post(auth::poll))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

/// Wire the token manager, upstream client and router from configuration.
async fn build_state(config: &Config, prometheus: PrometheusHandle) -> Result<AppState> {
    let client = reqwest::Client::builder()
        .build()
        .context("failed to build HTTP client")?;

    let store = Arc::new(CredentialStore::new(&config.qwen.credentials_dir));
    let tokens = Arc::new(
        TokenManager::new(store, client.clone()).with_poll_budget(config.poll_timeout()),
    );
    let upstream = Arc::new(QwenUpstream::new(
        client,
        config.upstream_timeout(),
        config.qwen.default_model.clone(),
    ));
    let counter = Arc::new(
        RequestCounter::load(config.qwen.credentials_dir.join(REQUEST_COUNTS_FILE)).await,
    );
    let router = AccountRouter::new(tokens.clone(), upstream, counter)
        .with_default_account(config.qwen.default_account.clone());

    Ok(AppState {
        router: Arc::new(router),
        tokens,
        api_key: config.server.api_key.clone().map(Arc::new),
        stream_enabled: config.qwen.stream,
        prometheus,
        started_at: Instant::now(),
    })
}

/// Log every discovered account with its token validity.
async fn log_accounts(tokens: &TokenManager, default_account: Option<&str>) {
    let store = tokens.store();
    match store.load_all_accounts().await {
        Ok(0) => {
            match store.load_credentials().await {
                Ok(Some(creds)) => info!(
                    account_id = DEFAULT_ACCOUNT_ID,
                    valid = TokenManager::is_token_valid(&creds),
                    "single-account mode"
                ),
                Ok(None) => warn!(
                    credentials_dir = %store.dir().display(),
                    "no credentials found, authenticate via POST /auth/initiate"
                ),
                Err(e) => warn!(error = %e, "failed to read default credentials"),
            }
        }
        Ok(count) => {
            info!(accounts = count, default_account, "multi-account mode");
            for id in store.account_ids().await {
                if let Some(creds) = store.get_account_credentials(&id).await {
                    let valid = TokenManager::is_token_valid(&creds);
                    info!(account_id = %id, valid, "account loaded");
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to scan credential directory"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting qwen-openai-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    match &config_path {
        Some(path) => info!(path = %path.display(), "loading configuration"),
        None => info!("no configuration file, using defaults"),
    }
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;

    info!(
        listen_addr = %config.server.listen_addr,
        credentials_dir = %config.qwen.credentials_dir.display(),
        default_account = config.qwen.default_account.as_deref(),
        default_model = %config.qwen.default_model,
        stream = config.qwen.stream,
        api_key_required = config.server.api_key.is_some(),
        "configuration loaded"
    );

    let state = build_state(&config, prometheus_handle).await?;
    log_accounts(&state.tokens, config.qwen.default_account.as_deref()).await;

    let app = build_router(
        state,
        config.server.max_connections,
        config.server.body_limit_bytes,
    );

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timeout starts when the shutdown signal fires, not when the
    // server starts.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness plus per-account request counts for the current UTC day.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let accounts = state.router.usage().await;
    axum::Json(serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "accounts": accounts,
    }))
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
