//! In-process cache of the tokens bound to each session.
//!
//! Access and refresh tokens never leave process memory. Bearer tokens are
//! indexed by their SHA-256 so the auth middleware can resolve a request to
//! its session without storing the raw value twice.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::services::identity_provider::UserClaims;
use crate::types::{SessionId, UserId};
use crate::utils::security::sha256_hex;

#[derive(Debug, Clone, PartialEq)]
pub struct CachedTokens {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub access_token: String,
    pub access_expires_at: DateTime<Utc>,
    /// Identity provider refresh token; `None` when the grant had no offline scope.
    pub refresh_token: Option<String>,
    /// SHA-256 of the opaque handle given to the browser instead of the refresh token.
    pub refresh_handle_hash: String,
    /// End of the refresh window; `None` when the provider did not say.
    pub refresh_expires_at: Option<DateTime<Utc>>,
    pub claims: UserClaims,
}

impl CachedTokens {
    /// True while more than `margin` of the access token lifetime remains.
    pub fn is_fresh(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        self.access_expires_at - now > margin
    }

    /// True once the entry can neither authenticate nor be refreshed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match (&self.refresh_token, self.refresh_expires_at) {
            (Some(_), Some(refresh_expires_at)) => refresh_expires_at <= now,
            (Some(_), None) => false,
            (None, _) => self.access_expires_at <= now,
        }
    }
}

#[derive(Default)]
struct Entries {
    by_session: HashMap<SessionId, CachedTokens>,
    by_access_hash: HashMap<String, SessionId>,
}

impl Entries {
    fn remove(&mut self, session_id: SessionId) -> Option<CachedTokens> {
        let removed = self.by_session.remove(&session_id)?;
        self.by_access_hash
            .remove(&sha256_hex(&removed.access_token));
        Some(removed)
    }

    fn prune(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.by_session.len();
        self.by_session.retain(|_, tokens| !tokens.is_expired(now));
        let by_session = &self.by_session;
        self.by_access_hash
            .retain(|_, session_id| by_session.contains_key(session_id));
        before - self.by_session.len()
    }
}

#[derive(Default)]
pub struct TokenCacheService {
    entries: RwLock<Entries>,
}

impl TokenCacheService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `tokens` for their session, replacing (and unindexing) any
    /// previous access token. Entries past their refresh window are dropped
    /// on the way.
    #[tracing::instrument(level = "debug", name = "token_cache_store", skip_all, fields(session_id = %tokens.session_id))]
    pub async fn cache_tokens(&self, tokens: CachedTokens) {
        let mut entries = self.entries.write().await;
        entries.prune(Utc::now());
        entries.remove(tokens.session_id);
        entries
            .by_access_hash
            .insert(sha256_hex(&tokens.access_token), tokens.session_id);
        entries.by_session.insert(tokens.session_id, tokens);
    }

    pub async fn get(&self, session_id: SessionId) -> Option<CachedTokens> {
        self.entries.read().await.by_session.get(&session_id).cloned()
    }

    /// Resolves a bearer token. Only the current access token of a session matches.
    pub async fn find_by_access_token(&self, access_token: &str) -> Option<CachedTokens> {
        let entries = self.entries.read().await;
        let session_id = entries.by_access_hash.get(&sha256_hex(access_token))?;
        entries.by_session.get(session_id).cloned()
    }

    /// Drops every entry that expired before `now`. Returns how many went.
    pub async fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        self.entries.write().await.prune(now)
    }

    #[tracing::instrument(level = "debug", name = "token_cache_invalidate", skip(self))]
    pub async fn invalidate_session(&self, session_id: SessionId) -> Option<CachedTokens> {
        self.entries.write().await.remove(session_id)
    }

    /// Drops every cached entry of `user_id` except `except`. Returns the
    /// removed entries so callers can revoke their refresh tokens upstream.
    #[tracing::instrument(level = "debug", name = "token_cache_invalidate_user", skip(self))]
    pub async fn invalidate_user_tokens(
        &self,
        user_id: UserId,
        except: Option<SessionId>,
    ) -> Vec<CachedTokens> {
        let mut entries = self.entries.write().await;
        let targets: Vec<SessionId> = entries
            .by_session
            .values()
            .filter(|tokens| tokens.user_id == user_id && Some(tokens.session_id) != except)
            .map(|tokens| tokens.session_id)
            .collect();
        targets
            .into_iter()
            .filter_map(|session_id| entries.remove(session_id))
            .collect()
    }
}
