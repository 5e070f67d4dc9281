//! Pending HTTP-01 challenges
//!
//! The ACME client publishes one key authorization per hostname and token
//! while an order is being validated; the challenge server reads them back.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace};

use crate::errors::ChallengeLookupError;

/// Path under which issuers fetch HTTP-01 responses
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Where the challenge server finds key authorizations of one issuer
/// environment. An `Err` is answered as an unknown token.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn lookup(
        &self,
        hostname: &str,
        token: &str,
    ) -> Result<Option<String>, ChallengeLookupError>;
}

type ChallengeKey = (String, String);

fn challenge_key(hostname: &str, token: &str) -> ChallengeKey {
    (hostname.to_ascii_lowercase(), token.to_owned())
}

#[derive(Debug, Clone)]
struct Published {
    key_authorization: String,
    since: Instant,
}

/// In-memory [`ChallengeStore`] shared between an ACME client and the
/// challenge server. Clones see the same entries.
#[derive(Debug, Clone, Default)]
pub struct ChallengeManager {
    entries: Arc<DashMap<ChallengeKey, Published>>,
}

impl ChallengeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `key_authorization` for `token` on `hostname`. The hostname
    /// is matched case-insensitively.
    pub fn add_challenge(&self, hostname: &str, token: &str, key_authorization: &str) {
        debug!(hostname = %hostname, token = %token, "Publishing HTTP-01 challenge");
        self.entries.insert(
            challenge_key(hostname, token),
            Published {
                key_authorization: key_authorization.to_owned(),
                since: Instant::now(),
            },
        );
    }

    pub fn remove_challenge(&self, hostname: &str, token: &str) {
        if self.entries.remove(&challenge_key(hostname, token)).is_some() {
            debug!(hostname = %hostname, token = %token, "Withdrew HTTP-01 challenge");
        }
    }

    pub fn get_response(&self, hostname: &str, token: &str) -> Option<String> {
        let found = self
            .entries
            .get(&challenge_key(hostname, token))
            .map(|entry| entry.key_authorization.clone());
        trace!(hostname = %hostname, token = %token, found = found.is_some(), "Challenge lookup");
        found
    }

    /// Token part of a challenge path, `None` for any other path.
    pub fn extract_token(path: &str) -> Option<&str> {
        path.strip_prefix(ACME_CHALLENGE_PREFIX)
    }

    /// Forget challenges published more than `max_age` ago. Orders cut
    /// short by a timeout never withdraw theirs.
    pub fn cleanup_expired(&self, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, published| published.since.elapsed() < max_age);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed = removed, "Dropped stale HTTP-01 challenges");
        }
        removed
    }

    pub fn pending_count(&self) -> usize {
        self.entries.len()
    }
}

#[async_trait]
impl ChallengeStore for ChallengeManager {
    async fn lookup(
        &self,
        hostname: &str,
        token: &str,
    ) -> Result<Option<String>, ChallengeLookupError> {
        Ok(self.get_response(hostname, token))
    }
}
