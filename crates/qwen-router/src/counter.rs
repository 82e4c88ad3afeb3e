//! Per-account daily request counters
//!
//! Counts reset together for every account when the UTC date changes. The
//! whole state is rewritten to disk on every increment; a crash between the
//! in-memory update and the write may lose the latest increment. Counts are
//! advisory and never block a call.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Persisted counter file: `{"lastResetDate": "2025-01-31", "requests": {...}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestCounts {
    #[serde(rename = "lastResetDate")]
    pub last_reset_date: NaiveDate,
    #[serde(default)]
    pub requests: BTreeMap<String, u64>,
}

impl RequestCounts {
    fn new(today: NaiveDate) -> Self {
        Self {
            last_reset_date: today,
            requests: BTreeMap::new(),
        }
    }

    /// Clear all counts if `today` differs from the last reset date, in
    /// either direction. Returns whether a reset happened.
    fn roll_over(&mut self, today: NaiveDate) -> bool {
        if today != self.last_reset_date {
            self.requests.clear();
            self.last_reset_date = today;
            true
        } else {
            false
        }
    }
}

pub struct RequestCounter {
    path: PathBuf,
    state: Mutex<RequestCounts>,
}

impl RequestCounter {
    /// Load the counter file. A missing or malformed file starts a fresh
    /// day with no counts.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let today = Utc::now().date_naive();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<RequestCounts>(&contents) {
                Ok(counts) => {
                    debug!(path = %path.display(), accounts = counts.requests.len(), "loaded request counts");
                    counts
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "malformed request counter file, starting fresh");
                    RequestCounts::new(today)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RequestCounts::new(today),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable request counter file, starting fresh");
                RequestCounts::new(today)
            }
        };

        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// Count one request for `account_id` and persist. Returns the new count.
    pub async fn increment(&self, account_id: &str) -> u64 {
        self.increment_at(account_id, Utc::now().date_naive()).await
    }

    pub async fn increment_at(&self, account_id: &str, today: NaiveDate) -> u64 {
        let (count, snapshot) = {
            let mut state = self.state.lock().await;
            if state.roll_over(today) {
                info!(date = %today, "new UTC day, request counts reset");
            }
            let count = state.requests.entry(account_id.to_string()).or_insert(0);
            *count += 1;
            (*count, state.clone())
        };

        // Written outside the lock; concurrent writers race, last rename wins
        self.persist(&snapshot).await;
        count
    }

    /// Today's count for `account_id`.
    pub async fn get(&self, account_id: &str) -> u64 {
        self.get_at(account_id, Utc::now().date_naive()).await
    }

    pub async fn get_at(&self, account_id: &str, today: NaiveDate) -> u64 {
        let mut state = self.state.lock().await;
        state.roll_over(today);
        state.requests.get(account_id).copied().unwrap_or(0)
    }

    /// Current state with the day rollover applied.
    pub async fn snapshot(&self) -> RequestCounts {
        let mut state = self.state.lock().await;
        state.roll_over(Utc::now().date_naive());
        state.clone()
    }

    async fn persist(&self, counts: &RequestCounts) {
        let json = match serde_json::to_vec_pretty(counts) {
            Ok(j) => j,
            Err(e) => {
                warn!(error = %e, "failed to serialize request counts");
                return;
            }
        };
        if let Err(e) = common::write_atomic(&self.path, &json).await {
            warn!(path = %self.path.display(), error = %e, "failed to persist request counts");
        }
    }
}
