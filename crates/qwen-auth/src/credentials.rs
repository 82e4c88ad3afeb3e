//! Per-account OAuth credential files
//!
//! One JSON file per account in the credentials directory:
//! `oauth_creds.json` for the default account and `oauth_creds_<id>.json`
//! for named accounts. Named accounts are discovered by scanning the
//! directory; lexicographic id order is the rotation order.
//!
//! The files are the source of truth. The in-memory cache is rebuilt on
//! every `load_all_accounts()` and updated on every `save()`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_CREDENTIALS_FILE, NAMED_CREDENTIALS_PREFIX};
use crate::error::{Error, Result};
use crate::token::TokenResponse;

/// A single account's OAuth credentials, in the on-disk shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QwenCredentials {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    /// Per-account API host, normalized by the upstream client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_url: Option<String>,
    /// Expiry as unix timestamp in milliseconds
    pub expiry_date: u64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl QwenCredentials {
    /// Build credentials from a fresh token answer.
    ///
    /// `previous` supplies the refresh token and endpoint when the answer
    /// omits them.
    pub fn from_token_response(
        token: TokenResponse,
        now_ms: u64,
        previous: Option<&QwenCredentials>,
    ) -> Self {
        let refresh_token = token
            .refresh_token
            .or_else(|| previous.map(|p| p.refresh_token.clone()))
            .unwrap_or_default();
        let resource_url = token
            .resource_url
            .or_else(|| previous.and_then(|p| p.resource_url.clone()));

        Self {
            access_token: token.access_token,
            refresh_token,
            token_type: token.token_type.unwrap_or_else(default_token_type),
            resource_url,
            expiry_date: now_ms.saturating_add(token.expires_in.saturating_mul(1000)),
        }
    }
}

/// Account ids become file names, so only a conservative charset is allowed.
pub fn validate_account_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !id.starts_with('.');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidAccountId(id.to_string()))
    }
}

#[derive(Default)]
struct Accounts {
    /// Named account ids in rotation order
    order: Vec<String>,
    named: HashMap<String, QwenCredentials>,
    default: Option<QwenCredentials>,
}

/// Directory-backed credential cache.
///
/// Reads clone out of an `RwLock`, so request-time lookups never wait on
/// disk I/O from a concurrent refresh.
pub struct CredentialStore {
    dir: PathBuf,
    state: RwLock<Accounts>,
}

impl CredentialStore {
    /// Create a store over `dir`. Nothing is read until
    /// `load_all_accounts()` or `load_credentials()`.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            state: RwLock::new(Accounts::default()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `account`; `None` is the default account.
    pub fn path_for(&self, account: Option<&str>) -> PathBuf {
        match account {
            None => self.dir.join(DEFAULT_CREDENTIALS_FILE),
            Some(id) => self.dir.join(format!("{NAMED_CREDENTIALS_PREFIX}{id}.json")),
        }
    }

    /// Rescan the directory and reload every named account.
    ///
    /// A missing directory means zero accounts. Unreadable or malformed files
    /// are skipped with a warning so one bad file cannot take the gateway
    /// down. Returns the number of named accounts.
    pub async fn load_all_accounts(&self) -> Result<usize> {
        let mut loaded = HashMap::new();

        match tokio::fs::read_dir(&self.dir).await {
            Ok(mut entries) => {
                while let Some(entry) = entries
                    .next_entry()
                    .await
                    .map_err(|e| Error::Io(format!("scanning credentials dir: {e}")))?
                {
                    let name = entry.file_name();
                    let Some(id) = name.to_str().and_then(account_id_from_file_name) else {
                        continue;
                    };
                    if validate_account_id(id).is_err() {
                        continue;
                    }
                    match read_credentials(&entry.path()).await {
                        Ok(Some(creds)) => {
                            loaded.insert(id.to_string(), creds);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(account_id = id, error = %e, "skipping unreadable credential file");
                        }
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(dir = %self.dir.display(), "credentials directory does not exist");
            }
            Err(e) => return Err(Error::Io(format!("reading credentials dir: {e}"))),
        }

        let mut order: Vec<String> = loaded.keys().cloned().collect();
        order.sort();
        let count = order.len();

        let mut state = self.state.write().await;
        state.order = order;
        state.named = loaded;
        Ok(count)
    }

    /// Named account ids in rotation order.
    pub async fn account_ids(&self) -> Vec<String> {
        self.state.read().await.order.clone()
    }

    /// Cached credentials for a named account.
    pub async fn get_account_credentials(&self, id: &str) -> Option<QwenCredentials> {
        self.state.read().await.named.get(id).cloned()
    }

    /// Load the default account from disk, caching the result.
    pub async fn load_credentials(&self) -> Result<Option<QwenCredentials>> {
        let creds = read_credentials(&self.path_for(None)).await?;
        self.state.write().await.default = creds.clone();
        Ok(creds)
    }

    /// Credentials for `account`, from the cache for named accounts and from
    /// disk for the default account.
    pub async fn credentials_for(&self, account: Option<&str>) -> Result<Option<QwenCredentials>> {
        match account {
            None => self.load_credentials().await,
            Some(id) => Ok(self.get_account_credentials(id).await),
        }
    }

    /// Persist credentials for `account` and update the cache.
    pub async fn save(&self, account: Option<&str>, creds: &QwenCredentials) -> Result<()> {
        if let Some(id) = account {
            validate_account_id(id)?;
        }
        let json = serde_json::to_vec_pretty(creds)
            .map_err(|e| Error::CredentialParse(format!("serializing credentials: {e}")))?;
        let path = self.path_for(account);
        common::write_atomic(&path, &json)
            .await
            .map_err(|e| Error::Io(format!("writing {}: {e}", path.display())))?;

        let mut state = self.state.write().await;
        match account {
            None => state.default = Some(creds.clone()),
            Some(id) => {
                if state.named.insert(id.to_string(), creds.clone()).is_none() {
                    state.order.push(id.to_string());
                    state.order.sort();
                    info!(account_id = id, "added account");
                }
            }
        }
        Ok(())
    }
}

/// `oauth_creds_<id>.json` -> `<id>`
fn account_id_from_file_name(name: &str) -> Option<&str> {
    name.strip_prefix(NAMED_CREDENTIALS_PREFIX)?
        .strip_suffix(".json")
        .filter(|id| !id.is_empty())
}

async fn read_credentials(path: &Path) -> Result<Option<QwenCredentials>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
    };
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| Error::CredentialParse(format!("parsing {}: {e}", path.display())))
}
