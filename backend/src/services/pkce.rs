//! PKCE (RFC 7636, S256) material for the authorization-code login and the
//! short-lived store that binds a verifier to its `state` parameter.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::utils::security::random_token;

/// 32 random bytes encode to a 43 character verifier, the RFC minimum.
const VERIFIER_BYTES: usize = 32;
const STATE_BYTES: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

pub fn challenge_for(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

pub fn generate_pkce_pair() -> PkcePair {
    let verifier = random_token(VERIFIER_BYTES);
    let challenge = challenge_for(&verifier);
    PkcePair {
        verifier,
        challenge,
    }
}

pub fn generate_state() -> String {
    random_token(STATE_BYTES)
}

/// Storage for verifiers between login start and callback.
#[async_trait]
pub trait VerifierStore: Send + Sync {
    async fn put(&self, state: &str, verifier: String);

    /// Removes and returns the verifier. A second take for the same state
    /// always returns `None`.
    async fn take(&self, state: &str) -> Option<String>;
}

pub struct InMemoryVerifierStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryVerifierStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl VerifierStore for InMemoryVerifierStore {
    async fn put(&self, state: &str, verifier: String) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        entries.insert(state.to_string(), (verifier, now + self.ttl));
    }

    async fn take(&self, state: &str) -> Option<String> {
        let (verifier, expires_at) = self.entries.lock().await.remove(state)?;
        if expires_at <= Instant::now() {
            tracing::debug!("PKCE verifier expired before callback");
            return None;
        }
        Some(verifier)
    }
}
