//! Consecutive authentication-failure counters
//!
//! In-memory only. Owned by the router and shared with stream relays; never
//! persisted. Concurrent requests may interleave increments and resets.

use std::collections::HashMap;

use tokio::sync::Mutex;

#[derive(Default)]
pub struct AuthErrorRegistry {
    counts: Mutex<HashMap<String, u32>>,
}

impl AuthErrorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an auth error; returns the new consecutive count.
    pub async fn increment(&self, account_id: &str) -> u32 {
        let mut counts = self.counts.lock().await;
        let count = counts.entry(account_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub async fn reset(&self, account_id: &str) {
        self.counts.lock().await.insert(account_id.to_string(), 0);
    }

    pub async fn get(&self, account_id: &str) -> u32 {
        self.counts
            .lock()
            .await
            .get(account_id)
            .copied()
            .unwrap_or(0)
    }
}
