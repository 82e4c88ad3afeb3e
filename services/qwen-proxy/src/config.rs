//! Configuration types and loading
//!
//! Config precedence: env vars > config file > defaults. The inbound API key
//! comes from QWEN_PROXY_API_KEY or `api_key_file` and is never read from
//! the TOML directly.

use common::Secret;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "qwen-proxy.toml";

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub qwen: QwenConfig,
}

/// Inbound HTTP settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,
    /// File holding the inbound API key (alternative to QWEN_PROXY_API_KEY)
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
    /// `None` disables the API-key check
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
}

/// Account and upstream settings
#[derive(Debug, Deserialize)]
pub struct QwenConfig {
    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: PathBuf,
    /// Named account every call starts from
    #[serde(default)]
    pub default_account: Option<String>,
    #[serde(default = "default_model")]
    pub default_model: String,
    /// `false` answers streaming requests with a regular completion
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            max_connections: default_max_connections(),
            body_limit_bytes: default_body_limit(),
            api_key_file: None,
            api_key: None,
        }
    }
}

impl Default for QwenConfig {
    fn default() -> Self {
        Self {
            credentials_dir: default_credentials_dir(),
            default_account: None,
            default_model: default_model(),
            stream: default_stream(),
            upstream_timeout_secs: default_upstream_timeout(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

fn default_max_connections() -> usize {
    1000
}

fn default_body_limit() -> usize {
    10 * 1024 * 1024
}

fn default_credentials_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".qwen"),
        None => PathBuf::from(".qwen"),
    }
}

fn default_model() -> String {
    provider::DEFAULT_MODEL.to_string()
}

fn default_stream() -> bool {
    true
}

fn default_upstream_timeout() -> u64 {
    300
}

fn default_poll_timeout() -> u64 {
    300
}

impl Config {
    /// Load configuration from a TOML file (or defaults when `path` is
    /// `None`), then overlay environment variables and validate.
    pub fn load(path: Option<&Path>) -> common::Result<Self> {
        let mut config = match path {
            Some(path) => toml::from_str(&std::fs::read_to_string(path)?)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay environment overrides read through `lookup`.
    ///
    /// API key resolution order:
    /// 1. QWEN_PROXY_API_KEY
    /// 2. `api_key_file` from config
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> common::Result<()> {
        if let Some(account) = lookup("QWEN_DEFAULT_ACCOUNT").filter(|s| !s.is_empty()) {
            self.qwen.default_account = Some(account);
        }
        if let Some(dir) = lookup("QWEN_CREDENTIALS_DIR").filter(|s| !s.is_empty()) {
            self.qwen.credentials_dir = PathBuf::from(dir);
        }

        if let Some(host) = lookup("HOST") {
            let ip = host.parse().map_err(|e| {
                common::Error::Config(format!("HOST must be an IP address, got {host:?}: {e}"))
            })?;
            self.server.listen_addr.set_ip(ip);
        }
        if let Some(port) = lookup("PORT") {
            let port = port.parse().map_err(|e| {
                common::Error::Config(format!("PORT must be a port number, got {port:?}: {e}"))
            })?;
            self.server.listen_addr.set_port(port);
        }

        if let Some(key) = lookup("QWEN_PROXY_API_KEY").filter(|s| !s.is_empty()) {
            self.server.api_key = Some(Secret::new(key));
        } else if let Some(ref key_file) = self.server.api_key_file {
            let key = std::fs::read_to_string(key_file).map_err(|e| {
                common::Error::Config(format!(
                    "failed to read api_key_file {}: {e}",
                    key_file.display()
                ))
            })?;
            let key = key.trim().to_owned();
            if !key.is_empty() {
                self.server.api_key = Some(Secret::new(key));
            }
        }
        Ok(())
    }

    fn validate(&self) -> common::Result<()> {
        if self.qwen.upstream_timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.qwen.poll_timeout_secs == 0 {
            return Err(common::Error::Config(
                "poll_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if let Some(ref account) = self.qwen.default_account {
            qwen_auth::validate_account_id(account)
                .map_err(|e| common::Error::Config(format!("default_account: {e}")))?;
        }
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.qwen.upstream_timeout_secs)
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.qwen.poll_timeout_secs)
    }

    /// Resolve the config file from the CLI arg, then CONFIG_PATH, then
    /// `qwen-proxy.toml` in the working directory. `None` when only the
    /// default applies and that file does not exist.
    pub fn resolve_path(cli_path: Option<&str>) -> Option<PathBuf> {
        if let Some(p) = cli_path {
            return Some(PathBuf::from(p));
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return Some(PathBuf::from(p));
        }
        let default = PathBuf::from(DEFAULT_CONFIG_FILE);
        default.exists().then_some(default)
    }
}
