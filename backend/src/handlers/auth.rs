use axum::{
    extract::{Extension, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;
use validator::Validate;

use crate::{
    error::AppError,
    middleware::AuthenticatedUser,
    models::session::Geolocation,
    services::{
        identity_provider::UserClaims,
        token_issuance::{AccessTokenOutcome, AuthError, IssuedAccessToken, LoginContext, LoginStart},
    },
    state::AppState,
    types::{SessionId, UserId},
    utils::network::{extract_device_id, extract_ip, extract_user_agent},
};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CallbackRequest {
    #[validate(length(min = 1, max = 2048))]
    pub code: String,
    #[validate(length(min = 1, max = 256))]
    pub state: String,
    /// Falls back to the `X-Device-Id` header.
    #[validate(length(min = 1, max = 128))]
    pub device_id: Option<String>,
    #[validate(length(max = 128))]
    pub device_name: Option<String>,
    pub geolocation: Option<Geolocation>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    /// Opaque handle for `/api/auth/refresh`; the identity provider refresh
    /// token never reaches the browser.
    pub refresh_handle: String,
    pub user: UserClaims,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RefreshRequest {
    pub session_id: SessionId,
    #[validate(length(min = 1, max = 256))]
    pub refresh_handle: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MeResponse {
    pub user_id: UserId,
    pub session_id: SessionId,
    pub claims: Option<UserClaims>,
}

pub async fn begin_login(State(state): State<AppState>) -> Json<LoginStart> {
    Json(state.issuance.begin_login().await)
}

pub async fn callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CallbackRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    payload.validate()?;
    let device_id = payload
        .device_id
        .or_else(|| extract_device_id(&headers))
        .ok_or_else(|| AppError::BadRequest("Device id is required".into()))?;

    let context = LoginContext {
        device_id,
        device_name: payload.device_name,
        user_agent: extract_user_agent(&headers),
        ip_address: extract_ip(&headers),
        geolocation: payload.geolocation,
    };
    let outcome = state
        .issuance
        .complete_login(&payload.code, &payload.state, context)
        .await?;

    Ok(Json(LoginResponse {
        session_id: outcome.session.id,
        user_id: outcome.session.user_id,
        access_token: outcome.access_token.access_token,
        token_type: outcome.access_token.token_type,
        expires_at: outcome.access_token.expires_at,
        refresh_handle: outcome.refresh_handle,
        user: outcome.claims,
    }))
}

pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> Result<Json<IssuedAccessToken>, AppError> {
    payload.validate()?;
    match state
        .issuance
        .request_access_token_for_handle(payload.session_id, &payload.refresh_handle)
        .await?
    {
        AccessTokenOutcome::Token(token) => Ok(Json(token)),
        AccessTokenOutcome::RequiresLogin { login_url } => {
            Err(AuthError::RefreshExhausted { login_url }.into())
        }
    }
}

pub async fn logout(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Value>, AppError> {
    let revoked = state.issuance.logout(user.session_id).await?;
    Ok(Json(json!({
        "message": "Logged out",
        "session_id": user.session_id,
        "revoked": revoked
    })))
}

pub async fn me(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Json<MeResponse> {
    Json(MeResponse {
        user_id: user.user_id,
        session_id: user.session_id,
        claims: state.issuance.claims(user.session_id).await,
    })
}
