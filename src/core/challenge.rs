//! Pending HTTP-01 challenge responses.
//!
//! The ACME authority publishes a key authorization here before telling the CA the
//! challenge is ready; the plaintext listener answers
//! `GET /.well-known/acme-challenge/{token}` from this table.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use scc::HashMap;

/// URL prefix the CA fetches challenge tokens from.
pub const CHALLENGE_PATH_PREFIX: &str = "/.well-known/acme-challenge/";

#[derive(Debug, Clone)]
struct PendingChallenge {
    hostname: String,
    key_authorization: String,
    published_at: Instant,
}

/// Shared table of challenge tokens. Cloning shares the table.
#[derive(Clone, Default)]
pub struct ChallengeManager {
    pending: Arc<HashMap<String, PendingChallenge>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `key_authorization` available under `token`.
    pub async fn publish(&self, token: &str, hostname: &str, key_authorization: &str) {
        let challenge = PendingChallenge {
            hostname: hostname.to_string(),
            key_authorization: key_authorization.to_string(),
            published_at: Instant::now(),
        };
        let _ = self
            .pending
            .upsert_async(token.to_string(), challenge)
            .await;
        tracing::debug!(hostname = %hostname, token = %token, "Published HTTP-01 challenge");
    }

    /// Key authorization for `token`, if one is pending.
    pub async fn respond(&self, token: &str) -> Option<String> {
        self.pending
            .read_async(token, |_, c| c.key_authorization.clone())
            .await
    }

    pub async fn withdraw(&self, token: &str) {
        let _ = self.pending.remove_async(token).await;
    }

    /// Drop every token published for `hostname`.
    pub async fn withdraw_host(&self, hostname: &str) {
        self.pending
            .retain_async(|_, c| c.hostname != hostname)
            .await;
    }

    /// Drop tokens older than `max_age`. Returns how many were removed.
    pub async fn purge_older_than(&self, max_age: Duration) -> usize {
        let before = self.pending.len();
        self.pending
            .retain_async(|_, c| c.published_at.elapsed() < max_age)
            .await;
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Extract the token from a challenge request path.
pub fn token_from_path(path: &str) -> Option<&str> {
    let token = path.strip_prefix(CHALLENGE_PATH_PREFIX)?;
    let valid = !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(token)
}
