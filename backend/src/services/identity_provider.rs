//! Client for the external OpenID Connect identity provider.
//!
//! Only the calls the session core needs are modelled: authorization-code
//! exchange, the refresh grant, RFC 7009 revocation and userinfo. Every call
//! runs under the configured [`RetryStrategy`] and carries the trace headers
//! of its attempt.
//!
//! Codes and rotating refresh tokens are single use, so token grants are only
//! resent when the previous attempt never reached the provider. A timed-out
//! grant may already have been consumed.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use lessonhub_resilience::headers::{RETRY_ATTEMPT_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER};
use lessonhub_resilience::{with_retry, RetryAttempt, RetryStrategy, Retryable};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpSettings {
    /// Base URL; endpoints live under `/connect/*`.
    pub issuer_url: String,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
    pub scopes: String,
}

impl Default for IdpSettings {
    fn default() -> Self {
        Self {
            issuer_url: "http://localhost:8080".to_string(),
            client_id: "lessonhub-web".to_string(),
            client_secret: None,
            redirect_uri: "http://localhost:3000/auth/callback".to_string(),
            scopes: "openid profile email offline_access".to_string(),
        }
    }
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Token endpoint response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_expires_in: Option<i64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// Claims returned by the userinfo endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct UserClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum IdpError {
    /// The connection failed before the request was sent.
    #[error("could not connect to identity provider: {0}")]
    Connect(String),
    #[error("identity provider unreachable: {0}")]
    Transport(String),
    #[error("identity provider request timed out")]
    Timeout,
    /// The code or refresh token was rejected as used, expired or revoked.
    #[error("invalid_grant: {0}")]
    InvalidGrant(String),
    #[error("identity provider returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected identity provider response: {0}")]
    Decode(String),
}

impl IdpError {
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, IdpError::InvalidGrant(_))
    }
}

impl Retryable for IdpError {
    fn status_code(&self) -> Option<u16> {
        match self {
            IdpError::Status { status, .. } => Some(*status),
            IdpError::InvalidGrant(_) => Some(400),
            _ => None,
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            IdpError::Connect(_) | IdpError::Transport(_) | IdpError::Timeout => true,
            IdpError::Status { status, .. } => *status >= 500,
            IdpError::InvalidGrant(_) | IdpError::Decode(_) => false,
        }
    }
}

impl From<reqwest::Error> for IdpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            IdpError::Connect(err.to_string())
        } else if err.is_timeout() {
            IdpError::Timeout
        } else if err.is_decode() {
            IdpError::Decode(err.to_string())
        } else {
            IdpError::Transport(err.to_string())
        }
    }
}

/// Failure of a single-use grant attempt. Only a request that never left
/// this process is safe to send again.
#[derive(Debug)]
struct GrantError(IdpError);

impl fmt::Display for GrantError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Retryable for GrantError {
    fn status_code(&self) -> Option<u16> {
        self.0.status_code()
    }

    fn is_transient(&self) -> bool {
        matches!(self.0, IdpError::Connect(_))
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Browser redirect target for an authorization-code + PKCE login.
    fn authorize_url(&self, state: &str, code_challenge: &str) -> String;

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet, IdpError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdpError>;

    async fn revoke(&self, refresh_token: &str) -> Result<(), IdpError>;

    async fn user_info(&self, access_token: &str) -> Result<UserClaims, IdpError>;
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    error: String,
}

pub struct HttpIdentityProvider {
    client: reqwest::Client,
    settings: IdpSettings,
    authorize_endpoint: Url,
    token_endpoint: Url,
    revocation_endpoint: Url,
    userinfo_endpoint: Url,
    retry: RetryStrategy,
}

impl HttpIdentityProvider {
    pub fn new(
        settings: IdpSettings,
        timeout: Duration,
        retry: RetryStrategy,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let base = settings.issuer_url.trim_end_matches('/');
        let endpoint = |path: &str| Url::parse(&format!("{}/connect/{}", base, path));

        Ok(Self {
            client,
            authorize_endpoint: endpoint("authorize")?,
            token_endpoint: endpoint("token")?,
            revocation_endpoint: endpoint("revocation")?,
            userinfo_endpoint: endpoint("userinfo")?,
            settings,
            retry,
        })
    }

    fn client_form(&self, mut form: Vec<(&'static str, String)>) -> Vec<(&'static str, String)> {
        form.push(("client_id", self.settings.client_id.clone()));
        if let Some(secret) = &self.settings.client_secret {
            form.push(("client_secret", secret.clone()));
        }
        form
    }

    async fn token_request(
        &self,
        form: Vec<(&'static str, String)>,
    ) -> Result<TokenSet, IdpError> {
        let form = self.client_form(form);
        with_retry(&self.retry, |attempt| {
            let request = with_trace_headers(
                self.client.post(self.token_endpoint.clone()).form(&form),
                &attempt,
            );
            async move {
                let response = request.send().await.map_err(|e| GrantError(e.into()))?;
                read_json(response).await.map_err(GrantError)
            }
        })
        .await
        .map_err(|GrantError(err)| err)
    }
}

fn with_trace_headers(request: RequestBuilder, attempt: &RetryAttempt) -> RequestBuilder {
    let mut request = request.header(TRACEPARENT_HEADER, attempt.trace.traceparent());
    if let Some(state) = &attempt.trace.trace_state {
        request = request.header(TRACESTATE_HEADER, state.as_str());
    }
    if attempt.is_retry() {
        request = request.header(RETRY_ATTEMPT_HEADER, attempt.number.to_string());
    }
    request
}

async fn error_from_response(response: reqwest::Response) -> IdpError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if matches!(status, StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED) {
        if let Ok(parsed) = serde_json::from_str::<OAuthErrorBody>(&body) {
            if parsed.error == "invalid_grant" {
                return IdpError::InvalidGrant(body);
            }
        }
    }
    IdpError::Status {
        status: status.as_u16(),
        body,
    }
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, IdpError> {
    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    response
        .json::<T>()
        .await
        .map_err(|e| IdpError::Decode(e.to_string()))
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    fn authorize_url(&self, state: &str, code_challenge: &str) -> String {
        let mut url = self.authorize_endpoint.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri)
            .append_pair("scope", &self.settings.scopes)
            .append_pair("state", state)
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");
        url.into()
    }

    async fn exchange_code(&self, code: &str, code_verifier: &str) -> Result<TokenSet, IdpError> {
        tracing::debug!("Exchanging authorization code");
        self.token_request(vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", self.settings.redirect_uri.clone()),
            ("code_verifier", code_verifier.to_string()),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, IdpError> {
        self.token_request(vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.to_string()),
        ])
        .await
    }

    async fn revoke(&self, refresh_token: &str) -> Result<(), IdpError> {
        let form = self.client_form(vec![
            ("token", refresh_token.to_string()),
            ("token_type_hint", "refresh_token".to_string()),
        ]);
        with_retry(&self.retry, |attempt| {
            let request = with_trace_headers(
                self.client
                    .post(self.revocation_endpoint.clone())
                    .form(&form),
                &attempt,
            );
            async move {
                let response = request.send().await?;
                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(error_from_response(response).await)
                }
            }
        })
        .await
    }

    async fn user_info(&self, access_token: &str) -> Result<UserClaims, IdpError> {
        with_retry(&self.retry, |attempt| {
            let request = with_trace_headers(
                self.client
                    .get(self.userinfo_endpoint.clone())
                    .bearer_auth(access_token),
                &attempt,
            );
            async move { read_json(request.send().await?).await }
        })
        .await
    }
}
