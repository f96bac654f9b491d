//! Token issuance and refresh.
//!
//! Exchanges authorization codes and refresh tokens at the identity provider
//! for short-lived access tokens bound to a [`Session`]. Refreshes are
//! serialized per process through a single-permit semaphore; the permit is
//! held for the whole check-refresh-store sequence so concurrent callers with
//! a stale token observe the first caller's result instead of refreshing
//! again.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use utoipa::ToSchema;

use crate::models::session::{CreateSessionDto, Geolocation, Session, USER_LOGOUT_REASON};
use crate::services::identity_provider::{IdentityProvider, IdpError, TokenSet, UserClaims};
use crate::services::pkce::{generate_pkce_pair, generate_state, VerifierStore};
use crate::services::session_lifecycle::{SessionError, SessionService};
use crate::services::token_cache::{CachedTokens, TokenCacheService};
use crate::types::{SessionId, UserId};
use crate::utils::security::{random_token, sha256_hex};
use lessonhub_resilience::Retryable;

const REFRESH_HANDLE_BYTES: usize = 32;
const EVENT_CAPACITY: usize = 256;
const TOKEN_INVALIDATION_REASON: &str = "Refresh token rejected by identity provider";

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("identity provider unavailable: {0}")]
    TransientNetwork(IdpError),
    #[error("authentication expired")]
    AuthenticationExpired,
    #[error("session can no longer be refreshed")]
    RefreshExhausted { login_url: String },
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error("authorization code was already used or has expired")]
    ReplayedAuthorizationCode,
    #[error("refresh handle does not match the session")]
    InvalidRefreshHandle,
    #[error(transparent)]
    Idp(IdpError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("token service is shutting down")]
    Unavailable,
}

impl From<IdpError> for AuthError {
    fn from(err: IdpError) -> Self {
        if err.is_transient() {
            AuthError::TransientNetwork(err)
        } else {
            AuthError::Idp(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct IssuedAccessToken {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

impl From<&CachedTokens> for IssuedAccessToken {
    fn from(tokens: &CachedTokens) -> Self {
        Self {
            access_token: tokens.access_token.clone(),
            token_type: "Bearer".to_string(),
            expires_at: tokens.access_expires_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AccessTokenOutcome {
    Token(IssuedAccessToken),
    /// Nothing usable is cached and the refresh grant failed; the caller must
    /// restart the login flow.
    RequiresLogin { login_url: String },
}

/// Device and network details recorded on the session opened by a login.
#[derive(Debug, Clone, Default)]
pub struct LoginContext {
    pub device_id: String,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LoginStart {
    pub authorize_url: String,
    pub state: String,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub session: Session,
    pub access_token: IssuedAccessToken,
    /// Opaque value the browser presents to refresh; only its hash is kept.
    pub refresh_handle: String,
    pub claims: UserClaims,
}

/// Identity behind a bearer token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenIdentity {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthEvent {
    LoggedIn {
        user_id: UserId,
        session_id: SessionId,
    },
    Refreshed {
        session_id: SessionId,
    },
    RefreshFailed {
        session_id: SessionId,
    },
    LoggedOut {
        session_id: SessionId,
    },
}

pub struct TokenIssuanceService {
    identity_provider: Arc<dyn IdentityProvider>,
    sessions: SessionService,
    verifiers: Arc<dyn VerifierStore>,
    tokens: TokenCacheService,
    gate: Semaphore,
    refresh_margin: Duration,
    login_path: String,
    events: broadcast::Sender<AuthEvent>,
}

impl TokenIssuanceService {
    pub fn new(
        identity_provider: Arc<dyn IdentityProvider>,
        sessions: SessionService,
        verifiers: Arc<dyn VerifierStore>,
        refresh_margin: std::time::Duration,
        login_path: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            identity_provider,
            sessions,
            verifiers,
            tokens: TokenCacheService::new(),
            gate: Semaphore::new(1),
            refresh_margin: Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| Duration::seconds(60)),
            login_path: login_path.into(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }

    /// Rejects further token requests. Used on shutdown.
    pub fn close(&self) {
        self.gate.close();
    }

    fn emit(&self, event: AuthEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn requires_login(&self) -> AccessTokenOutcome {
        AccessTokenOutcome::RequiresLogin {
            login_url: self.login_path.clone(),
        }
    }

    /// Starts an authorization-code + PKCE login. The verifier is kept under
    /// the returned `state` until the callback.
    pub async fn begin_login(&self) -> LoginStart {
        let pair = generate_pkce_pair();
        let state = generate_state();
        let authorize_url = self.identity_provider.authorize_url(&state, &pair.challenge);
        self.verifiers.put(&state, pair.verifier).await;
        LoginStart {
            authorize_url,
            state,
        }
    }

    #[tracing::instrument(skip_all, fields(device_id = %context.device_id))]
    pub async fn complete_login(
        &self,
        code: &str,
        state: &str,
        context: LoginContext,
    ) -> Result<LoginOutcome, AuthError> {
        // Taken before the exchange so a failed or retried exchange can never
        // reuse the verifier.
        let verifier = self
            .verifiers
            .take(state)
            .await
            .ok_or(AuthError::ReplayedAuthorizationCode)?;

        let tokens = self
            .identity_provider
            .exchange_code(code, &verifier)
            .await
            .map_err(|err| {
                if err.is_invalid_grant() {
                    AuthError::ReplayedAuthorizationCode
                } else {
                    err.into()
                }
            })?;
        let claims = match self.identity_provider.user_info(&tokens.access_token).await {
            Ok(claims) => claims,
            Err(err) => {
                // The new grant is useless without claims; don't leave it live upstream.
                if let Some(refresh_token) = &tokens.refresh_token {
                    if let Err(revoke_err) = self.identity_provider.revoke(refresh_token).await {
                        tracing::warn!(error = %revoke_err, "Failed to revoke unused refresh token");
                    }
                }
                return Err(err.into());
            }
        };

        let now = Utc::now();
        let user_id = UserId::from_subject(&claims.sub);
        let session = self
            .sessions
            .create(CreateSessionDto {
                user_id,
                device_id: context.device_id,
                device_name: context.device_name,
                user_agent: context.user_agent,
                ip_address: context.ip_address,
                geolocation: context.geolocation,
                refresh_token_reference_id: tokens.refresh_token.as_deref().map(sha256_hex),
                token_expires_at: refresh_expiry(&tokens, now),
            })
            .await?;
        let refresh_expires_at = session.token_expires_at;

        let refresh_handle = random_token(REFRESH_HANDLE_BYTES);
        let cached = CachedTokens {
            session_id: session.id,
            user_id,
            access_token: tokens.access_token,
            access_expires_at: now + Duration::seconds(tokens.expires_in),
            refresh_token: tokens.refresh_token,
            refresh_handle_hash: sha256_hex(&refresh_handle),
            refresh_expires_at,
            claims: claims.clone(),
        };
        let access_token = IssuedAccessToken::from(&cached);
        self.tokens.cache_tokens(cached).await;

        tracing::info!(session_id = %session.id, %user_id, "Login completed");
        self.emit(AuthEvent::LoggedIn {
            user_id,
            session_id: session.id,
        });

        Ok(LoginOutcome {
            session,
            access_token,
            refresh_handle,
            claims,
        })
    }

    /// Returns a usable access token for the session, refreshing it first
    /// when less than the refresh margin remains.
    #[tracing::instrument(skip(self))]
    pub async fn request_access_token(
        &self,
        session_id: SessionId,
    ) -> Result<AccessTokenOutcome, AuthError> {
        let _permit = self.gate.acquire().await.map_err(|_| AuthError::Unavailable)?;

        let session = self
            .sessions
            .get_by_id(session_id)
            .await?
            .ok_or(AuthError::SessionNotFound(session_id))?;
        let now = Utc::now();
        if !session.is_active_at(now) {
            self.tokens.invalidate_session(session_id).await;
            return Ok(self.requires_login());
        }

        let Some(cached) = self.tokens.get(session_id).await else {
            return Ok(self.requires_login());
        };
        if cached.is_fresh(now, self.refresh_margin) {
            return Ok(AccessTokenOutcome::Token(IssuedAccessToken::from(&cached)));
        }

        self.refresh_locked(&session, cached).await
    }

    /// Browser-facing refresh: the opaque handle must match the session.
    pub async fn request_access_token_for_handle(
        &self,
        session_id: SessionId,
        refresh_handle: &str,
    ) -> Result<AccessTokenOutcome, AuthError> {
        match self.tokens.get(session_id).await {
            Some(cached) if cached.refresh_handle_hash == sha256_hex(refresh_handle) => {
                self.request_access_token(session_id).await
            }
            Some(_) => Err(AuthError::InvalidRefreshHandle),
            None => match self.sessions.get_by_id(session_id).await? {
                Some(_) => Ok(self.requires_login()),
                None => Err(AuthError::SessionNotFound(session_id)),
            },
        }
    }

    async fn refresh_locked(
        &self,
        session: &Session,
        cached: CachedTokens,
    ) -> Result<AccessTokenOutcome, AuthError> {
        let session_id = session.id;
        let Some(refresh_token) = cached.refresh_token.clone() else {
            tracing::info!(%session_id, "No refresh token cached for stale session");
            self.tokens.invalidate_session(session_id).await;
            self.emit(AuthEvent::RefreshFailed { session_id });
            return Ok(self.requires_login());
        };

        match self.identity_provider.refresh(&refresh_token).await {
            Ok(tokens) => {
                let now = Utc::now();
                let token_expires_at = refresh_expiry(&tokens, now).or(session.token_expires_at);
                let refresh_token = tokens.refresh_token.clone().unwrap_or(refresh_token);
                let reference = sha256_hex(&refresh_token);

                let rotated = self
                    .sessions
                    .rotate_tokens(session_id, Some(reference.as_str()), token_expires_at)
                    .await?;
                if !rotated {
                    tracing::info!(%session_id, "Session revoked during refresh");
                    self.tokens.invalidate_session(session_id).await;
                    return Ok(self.requires_login());
                }

                let refreshed = CachedTokens {
                    access_token: tokens.access_token,
                    access_expires_at: now + Duration::seconds(tokens.expires_in),
                    refresh_token: Some(refresh_token),
                    refresh_expires_at: token_expires_at,
                    ..cached
                };
                let issued = IssuedAccessToken::from(&refreshed);
                self.tokens.cache_tokens(refreshed).await;

                tracing::debug!(%session_id, "Access token refreshed");
                self.emit(AuthEvent::Refreshed { session_id });
                Ok(AccessTokenOutcome::Token(issued))
            }
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "Refresh grant failed");
                self.tokens.invalidate_session(session_id).await;
                if err.is_invalid_grant() {
                    self.sessions
                        .revoke_for_token_invalidation(session_id, TOKEN_INVALIDATION_REASON)
                        .await?;
                }
                self.emit(AuthEvent::RefreshFailed { session_id });
                Ok(self.requires_login())
            }
        }
    }

    /// Resolves a bearer token to its session. Only the current, unexpired
    /// access token of a session is accepted.
    pub async fn authenticate(&self, access_token: &str) -> Result<TokenIdentity, AuthError> {
        let cached = self
            .tokens
            .find_by_access_token(access_token)
            .await
            .ok_or(AuthError::AuthenticationExpired)?;
        if cached.access_expires_at <= Utc::now() {
            return Err(AuthError::AuthenticationExpired);
        }
        Ok(TokenIdentity {
            user_id: cached.user_id,
            session_id: cached.session_id,
            expires_at: cached.access_expires_at,
        })
    }

    pub async fn claims(&self, session_id: SessionId) -> Option<UserClaims> {
        self.tokens.get(session_id).await.map(|cached| cached.claims)
    }

    /// Revokes the session, drops its tokens and revokes its refresh token
    /// at the identity provider. Returns false when it was already terminal.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_session(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<bool, AuthError> {
        let (revoked, evicted) = {
            let _permit = self.gate.acquire().await.map_err(|_| AuthError::Unavailable)?;
            let revoked = self.sessions.revoke(session_id, reason).await?;
            (revoked, self.tokens.invalidate_session(session_id).await)
        };

        if let Some(cached) = evicted {
            self.revoke_upstream(cached).await;
        }
        if revoked {
            self.emit(AuthEvent::LoggedOut { session_id });
        }
        Ok(revoked)
    }

    pub async fn logout(&self, session_id: SessionId) -> Result<bool, AuthError> {
        self.revoke_session(session_id, USER_LOGOUT_REASON).await
    }

    /// "Log out other devices": revokes every other active session of the user.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_other_sessions(
        &self,
        user_id: UserId,
        current: SessionId,
    ) -> Result<u64, AuthError> {
        let (revoked, evicted) = {
            let _permit = self.gate.acquire().await.map_err(|_| AuthError::Unavailable)?;
            let revoked = self
                .sessions
                .revoke_all_returning_ids(user_id, Some(current))
                .await?;
            (
                revoked,
                self.tokens
                    .invalidate_user_tokens(user_id, Some(current))
                    .await,
            )
        };

        for cached in evicted {
            self.revoke_upstream(cached).await;
        }
        for &session_id in &revoked {
            self.emit(AuthEvent::LoggedOut { session_id });
        }
        Ok(revoked.len() as u64)
    }

    /// Drops cached tokens whose refresh window has passed. Returns how many
    /// entries went.
    pub async fn prune_expired_tokens(&self) -> usize {
        self.tokens.prune_expired(Utc::now()).await
    }

    async fn revoke_upstream(&self, cached: CachedTokens) {
        let Some(refresh_token) = cached.refresh_token else {
            return;
        };
        if let Err(err) = self.identity_provider.revoke(&refresh_token).await {
            tracing::warn!(
                session_id = %cached.session_id,
                error = %err,
                "Failed to revoke refresh token at identity provider"
            );
        }
    }
}

fn refresh_expiry(tokens: &TokenSet, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    tokens
        .refresh_expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| now + Duration::seconds(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::session::SessionStatus;
    use crate::repositories::session::InMemorySessionRepository;
    use crate::services::identity_provider::MockIdentityProvider;
    use crate::services::pkce::InMemoryVerifierStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    const SUBJECT: &str = "0b6c3f8e-6a43-4c5c-9a43-7d6f3b1f2c11";

    fn token_set(access: &str, expires_in: i64) -> TokenSet {
        TokenSet {
            access_token: access.to_string(),
            refresh_token: Some(format!("refresh-for-{access}")),
            expires_in,
            refresh_expires_in: Some(3600),
            token_type: "Bearer".to_string(),
            id_token: None,
            scope: None,
        }
    }

    fn claims() -> UserClaims {
        UserClaims {
            sub: SUBJECT.to_string(),
            email: Some("learner@example.com".to_string()),
            name: Some("Learner".to_string()),
            roles: vec!["learner".to_string()],
        }
    }

    fn context(device: &str) -> LoginContext {
        LoginContext {
            device_id: device.to_string(),
            device_name: Some("Firefox".to_string()),
            user_agent: Some("test-agent".to_string()),
            ip_address: Some("127.0.0.1".to_string()),
            geolocation: None,
        }
    }

    /// Mock that serves logins with the given access token lifetime.
    fn login_mock(expires_in: i64) -> MockIdentityProvider {
        let mut idp = MockIdentityProvider::new();
        idp.expect_authorize_url()
            .returning(|state, challenge| format!("https://idp/authorize?state={state}&code_challenge={challenge}"));
        idp.expect_exchange_code()
            .returning(move |code, _| Ok(token_set(&format!("access-{code}"), expires_in)));
        idp.expect_user_info().returning(|_| Ok(claims()));
        idp
    }

    fn build(idp: MockIdentityProvider) -> (TokenIssuanceService, SessionService) {
        let sessions = SessionService::new(Arc::new(InMemorySessionRepository::new()));
        let service = TokenIssuanceService::new(
            Arc::new(idp),
            sessions.clone(),
            Arc::new(InMemoryVerifierStore::new(std::time::Duration::from_secs(600))),
            std::time::Duration::from_secs(60),
            "/api/auth/login",
        );
        (service, sessions)
    }

    async fn login(service: &TokenIssuanceService, code: &str, device: &str) -> LoginOutcome {
        let start = service.begin_login().await;
        service
            .complete_login(code, &start.state, context(device))
            .await
            .expect("login succeeds")
    }

    #[tokio::test]
    async fn login_creates_active_session_and_caches_tokens() {
        let (service, sessions) = build(login_mock(900));
        let mut events = service.subscribe();

        let outcome = login(&service, "code-1", "device-a").await;

        assert_eq!(outcome.session.status, SessionStatus::Active);
        assert_eq!(outcome.session.user_id.to_string(), SUBJECT);
        assert_eq!(outcome.access_token.access_token, "access-code-1");
        assert!(outcome.session.token_expires_at.is_some());
        assert_eq!(
            outcome.session.refresh_token_reference_id.as_deref(),
            Some(sha256_hex("refresh-for-access-code-1").as_str())
        );
        assert!(sessions.get_by_id(outcome.session.id).await.unwrap().is_some());
        assert_eq!(service.claims(outcome.session.id).await, Some(claims()));

        assert_eq!(
            events.recv().await.unwrap(),
            AuthEvent::LoggedIn {
                user_id: outcome.session.user_id,
                session_id: outcome.session.id,
            }
        );
    }

    #[tokio::test]
    async fn verifier_is_consumed_even_when_exchange_fails() {
        let mut idp = MockIdentityProvider::new();
        idp.expect_authorize_url()
            .returning(|_, _| "https://idp/authorize".to_string());
        idp.expect_exchange_code()
            .times(1)
            .returning(|_, _| Err(IdpError::Timeout));
        let (service, _) = build(idp);

        let start = service.begin_login().await;
        let first = service
            .complete_login("code", &start.state, context("a"))
            .await;
        assert!(matches!(first, Err(AuthError::TransientNetwork(_))));

        let replay = service
            .complete_login("code", &start.state, context("a"))
            .await;
        assert!(matches!(replay, Err(AuthError::ReplayedAuthorizationCode)));
    }

    #[tokio::test]
    async fn invalid_grant_on_exchange_is_a_replay() {
        let mut idp = MockIdentityProvider::new();
        idp.expect_authorize_url()
            .returning(|_, _| "https://idp/authorize".to_string());
        idp.expect_exchange_code()
            .returning(|_, _| Err(IdpError::InvalidGrant("code used".to_string())));
        let (service, _) = build(idp);

        let start = service.begin_login().await;
        let result = service
            .complete_login("code", &start.state, context("a"))
            .await;
        assert!(matches!(result, Err(AuthError::ReplayedAuthorizationCode)));
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let mut idp = login_mock(900);
        idp.expect_refresh().never();
        let (service, _) = build(idp);
        let outcome = login(&service, "code-1", "a").await;

        let token = service
            .request_access_token(outcome.session.id)
            .await
            .unwrap();
        assert_eq!(token, AccessTokenOutcome::Token(outcome.access_token));
    }

    #[tokio::test]
    async fn token_inside_margin_is_refreshed_before_returning() {
        let mut idp = login_mock(30);
        idp.expect_refresh()
            .times(1)
            .returning(|_| Ok(token_set("access-refreshed", 900)));
        let (service, _) = build(idp);
        let outcome = login(&service, "code-1", "a").await;
        let mut events = service.subscribe();

        let token = service
            .request_access_token(outcome.session.id)
            .await
            .unwrap();
        match token {
            AccessTokenOutcome::Token(issued) => {
                assert_eq!(issued.access_token, "access-refreshed")
            }
            other => panic!("expected token, got {other:?}"),
        }
        assert_eq!(
            events.recv().await.unwrap(),
            AuthEvent::Refreshed {
                session_id: outcome.session.id
            }
        );
        assert!(service.authenticate("access-code-1").await.is_err());
        assert!(service.authenticate("access-refreshed").await.is_ok());
    }

    #[tokio::test]
    async fn failed_refresh_requires_login_and_caches_nothing() {
        let mut idp = login_mock(30);
        idp.expect_refresh()
            .times(1)
            .returning(|_| Err(IdpError::Timeout));
        let (service, sessions) = build(idp);
        let outcome = login(&service, "code-1", "a").await;

        let result = service
            .request_access_token(outcome.session.id)
            .await
            .unwrap();
        assert_eq!(
            result,
            AccessTokenOutcome::RequiresLogin {
                login_url: "/api/auth/login".to_string()
            }
        );
        assert!(service.claims(outcome.session.id).await.is_none());
        assert!(service.authenticate("access-code-1").await.is_err());

        // A transient failure does not revoke the session.
        let session = sessions.get_by_id(outcome.session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Active);
    }

    #[tokio::test]
    async fn invalid_grant_on_refresh_revokes_session() {
        let mut idp = login_mock(30);
        idp.expect_refresh()
            .returning(|_| Err(IdpError::InvalidGrant("revoked".to_string())));
        let (service, sessions) = build(idp);
        let outcome = login(&service, "code-1", "a").await;

        let result = service
            .request_access_token(outcome.session.id)
            .await
            .unwrap();
        assert!(matches!(result, AccessTokenOutcome::RequiresLogin { .. }));

        let session = sessions.get_by_id(outcome.session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::RevokedByTokenInvalidation);
    }

    #[tokio::test]
    async fn concurrent_stale_requests_share_one_refresh() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        let mut idp = login_mock(30);
        idp.expect_refresh().returning(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(token_set("access-refreshed", 900))
        });
        let (service, _) = build(idp);
        let service = Arc::new(service);
        let outcome = login(&service, "code-1", "a").await;

        let results = futures::future::join_all(
            (0..8).map(|_| service.request_access_token(outcome.session.id)),
        )
        .await;

        for result in results {
            match result.unwrap() {
                AccessTokenOutcome::Token(issued) => {
                    assert_eq!(issued.access_token, "access-refreshed")
                }
                other => panic!("expected token, got {other:?}"),
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_handle_must_match() {
        let (service, _) = build(login_mock(900));
        let outcome = login(&service, "code-1", "a").await;

        let wrong = service
            .request_access_token_for_handle(outcome.session.id, "not-the-handle")
            .await;
        assert!(matches!(wrong, Err(AuthError::InvalidRefreshHandle)));

        let right = service
            .request_access_token_for_handle(outcome.session.id, &outcome.refresh_handle)
            .await
            .unwrap();
        assert!(matches!(right, AccessTokenOutcome::Token(_)));

        let missing = service
            .request_access_token_for_handle(SessionId::new(), &outcome.refresh_handle)
            .await;
        assert!(matches!(missing, Err(AuthError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn logout_revokes_and_forgets_tokens() {
        let mut idp = login_mock(900);
        idp.expect_revoke().times(1).returning(|_| Ok(()));
        let (service, sessions) = build(idp);
        let outcome = login(&service, "code-1", "a").await;

        assert!(service.logout(outcome.session.id).await.unwrap());
        assert!(!service.logout(outcome.session.id).await.unwrap());

        let session = sessions.get_by_id(outcome.session.id).await.unwrap().unwrap();
        assert_eq!(session.status, SessionStatus::Revoked);
        assert_eq!(session.revocation_reason.as_deref(), Some(USER_LOGOUT_REASON));
        assert!(matches!(
            service.authenticate(&outcome.access_token.access_token).await,
            Err(AuthError::AuthenticationExpired)
        ));
    }

    #[tokio::test]
    async fn upstream_revoke_failure_does_not_fail_logout() {
        let mut idp = login_mock(900);
        idp.expect_revoke()
            .returning(|_| Err(IdpError::Transport("down".to_string())));
        let (service, _) = build(idp);
        let outcome = login(&service, "code-1", "a").await;

        assert!(service.logout(outcome.session.id).await.unwrap());
    }

    #[tokio::test]
    async fn revoke_other_sessions_keeps_current() {
        let mut idp = login_mock(900);
        idp.expect_revoke().times(1).returning(|_| Ok(()));
        let (service, sessions) = build(idp);
        let device_a = login(&service, "code-a", "device-a").await;
        let device_b = login(&service, "code-b", "device-b").await;

        let count = service
            .revoke_other_sessions(device_a.session.user_id, device_a.session.id)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let a = sessions.get_by_id(device_a.session.id).await.unwrap().unwrap();
        let b = sessions.get_by_id(device_b.session.id).await.unwrap().unwrap();
        assert_eq!(a.status, SessionStatus::Active);
        assert_eq!(b.status, SessionStatus::Revoked);
        assert!(service
            .authenticate(&device_a.access_token.access_token)
            .await
            .is_ok());
        assert!(service
            .authenticate(&device_b.access_token.access_token)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn revoke_other_sessions_reports_every_revoked_session() {
        let mut idp = login_mock(900);
        idp.expect_revoke().never();
        let (service, _) = build(idp);
        let device_a = login(&service, "code-a", "device-a").await;
        let device_b = login(&service, "code-b", "device-b").await;
        // Nothing cached for B any more, but its session row is still active.
        service.tokens.invalidate_session(device_b.session.id).await;
        let mut events = service.subscribe();

        let count = service
            .revoke_other_sessions(device_a.session.user_id, device_a.session.id)
            .await
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(
            events.recv().await.unwrap(),
            AuthEvent::LoggedOut {
                session_id: device_b.session.id
            }
        );
    }

    #[tokio::test]
    async fn unused_grant_is_revoked_when_claims_fail() {
        let mut idp = MockIdentityProvider::new();
        idp.expect_authorize_url()
            .returning(|_, _| "https://idp/authorize".to_string());
        idp.expect_exchange_code()
            .returning(|code, _| Ok(token_set(&format!("access-{code}"), 900)));
        idp.expect_user_info()
            .returning(|_| Err(IdpError::Decode("not json".to_string())));
        idp.expect_revoke()
            .withf(|token| token.to_string() == "refresh-for-access-code-1")
            .times(1)
            .returning(|_| Ok(()));
        let (service, sessions) = build(idp);

        let start = service.begin_login().await;
        let result = service
            .complete_login("code-1", &start.state, context("a"))
            .await;
        assert!(matches!(result, Err(AuthError::Idp(IdpError::Decode(_)))));
        assert!(sessions
            .get_active_for_user(UserId::from_subject(SUBJECT))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn tokens_past_refresh_window_are_pruned() {
        let (service, _) = build(login_mock(900));
        let outcome = login(&service, "code-1", "a").await;
        assert!(service.claims(outcome.session.id).await.is_some());

        // Nothing expires yet.
        assert_eq!(service.prune_expired_tokens().await, 0);

        let pruned = service
            .tokens
            .prune_expired(Utc::now() + Duration::hours(2))
            .await;
        assert_eq!(pruned, 1);
        assert!(service.claims(outcome.session.id).await.is_none());
        assert!(service
            .authenticate(&outcome.access_token.access_token)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_gate_reports_unavailable() {
        let (service, _) = build(login_mock(900));
        let outcome = login(&service, "code-1", "a").await;
        service.close();
        assert!(matches!(
            service.request_access_token(outcome.session.id).await,
            Err(AuthError::Unavailable)
        ));
    }
}
