//! CSRF state for the OAuth authorization flow.
//!
//! Every `/oauth/start` issues a single-use state token bound to the
//! (provider, user) pair that requested it; the callback must present the
//! token back within the expiry window. Expired entries are purged
//! opportunistically on issue and by a periodic background task.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Authorization attempt awaiting its callback.
#[derive(Clone, Debug)]
pub struct PendingAuth {
    pub provider: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

/// Issues and validates single-use OAuth state tokens.
#[derive(Clone)]
pub struct StateManager {
    pending: Arc<Mutex<HashMap<String, PendingAuth>>>,
    ttl: Duration,
}

impl StateManager {
    /// # Arguments
    /// * `ttl_seconds` - How long issued states stay claimable
    ///   (600 = 10 minutes is the usual choice)
    pub fn new(ttl_seconds: i64) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            ttl: Duration::seconds(ttl_seconds),
        }
    }

    /// Issues a fresh state token for an authorization attempt.
    pub fn issue(&self, provider: &str, user_id: &str) -> String {
        let state = Uuid::new_v4().to_string();
        let now = Utc::now();

        let mut pending = self.pending.lock().unwrap();
        // Opportunistic purge keeps the map bounded even without the
        // background task
        pending.retain(|_, entry| now - entry.created_at <= self.ttl);
        pending.insert(
            state.clone(),
            PendingAuth {
                provider: provider.to_string(),
                user_id: user_id.to_string(),
                created_at: now,
            },
        );

        state
    }

    /// Claims a state token. Single-use: the entry is removed whether or
    /// not it turns out to be expired.
    pub fn claim(&self, state: &str) -> Option<PendingAuth> {
        let entry = self.pending.lock().unwrap().remove(state)?;
        if Utc::now() - entry.created_at > self.ttl {
            return None;
        }
        Some(entry)
    }

    /// Removes expired entries.
    pub fn purge_expired(&self) {
        let now = Utc::now();
        self.pending
            .lock()
            .unwrap()
            .retain(|_, entry| now - entry.created_at <= self.ttl);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().unwrap().is_empty()
    }
}

/// Background task that purges expired states on an interval.
pub async fn run_state_cleanup(manager: StateManager, interval_seconds: u64) {
    let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(interval_seconds));
    loop {
        interval.tick().await;
        manager.purge_expired();
        tracing::debug!(remaining = manager.len(), "OAuth state cleanup complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_claim() {
        let manager = StateManager::new(600);
        let state = manager.issue("github", "user1");
        assert!(!state.is_empty());

        let entry = manager.claim(&state).expect("state should be claimable");
        assert_eq!(entry.provider, "github");
        assert_eq!(entry.user_id, "user1");
    }

    #[test]
    fn states_are_single_use() {
        let manager = StateManager::new(600);
        let state = manager.issue("github", "user1");

        assert!(manager.claim(&state).is_some());
        assert!(manager.claim(&state).is_none());
    }

    #[test]
    fn unknown_state_is_rejected() {
        let manager = StateManager::new(600);
        assert!(manager.claim("never-issued").is_none());
    }

    #[test]
    fn expired_state_is_rejected() {
        let manager = StateManager::new(0);
        let state = manager.issue("github", "user1");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(manager.claim(&state).is_none());
    }

    #[test]
    fn issue_purges_expired_entries() {
        let manager = StateManager::new(0);
        manager.issue("github", "user1");
        manager.issue("github", "user2");
        std::thread::sleep(std::time::Duration::from_millis(1100));

        // The purge during issue drops the two stale entries
        manager.issue("github", "user3");
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn purge_expired_removes_stale_entries() {
        let manager = StateManager::new(0);
        manager.issue("github", "user1");
        std::thread::sleep(std::time::Duration::from_millis(1100));
        manager.purge_expired();
        assert!(manager.is_empty());
    }
}
