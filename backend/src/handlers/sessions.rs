use axum::{
    extract::{Extension, Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::{
    error::AppError,
    middleware::AuthenticatedUser,
    models::session::{
        CreateSessionDto, DeviceSessionGroup, EffectiveStatus, Geolocation, Session,
    },
    state::AppState,
    types::SessionId,
    utils::network::{extract_device_id, extract_ip, extract_user_agent},
};

const USER_REVOKE_REASON: &str = "Revoked by user";

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    pub id: SessionId,
    pub device_id: String,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub status: EffectiveStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub is_current: bool,
}

impl SessionResponse {
    fn from_session(session: Session, current: SessionId, now: DateTime<Utc>) -> Self {
        Self {
            status: session.effective_status(now),
            is_current: session.id == current,
            id: session.id,
            device_id: session.device_id,
            device_name: session.device_name,
            user_agent: session.user_agent,
            ip_address: session.ip_address,
            geolocation: session.geolocation,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            token_expires_at: session.token_expires_at,
            revoked_at: session.revoked_at,
            revocation_reason: session.revocation_reason,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DeviceGroupResponse {
    pub device_id: String,
    pub device_name: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    /// True when the caller's own session is in this group.
    pub is_current: bool,
    pub sessions: Vec<SessionResponse>,
}

impl DeviceGroupResponse {
    fn from_group(group: DeviceSessionGroup, current: SessionId, now: DateTime<Utc>) -> Self {
        let sessions: Vec<SessionResponse> = group
            .sessions
            .into_iter()
            .map(|session| SessionResponse::from_session(session, current, now))
            .collect();
        Self {
            device_id: group.device_id,
            device_name: group.device_name,
            last_activity_at: group.last_activity_at,
            is_current: sessions.iter().any(|s| s.is_current),
            sessions,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateSessionRequest {
    /// Falls back to the `X-Device-Id` header.
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    /// Falls back to the `User-Agent` header.
    pub user_agent: Option<String>,
    /// Falls back to `X-Forwarded-For` / `X-Real-IP`.
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

async fn load_owned_session(
    state: &AppState,
    user: &AuthenticatedUser,
    session_id: SessionId,
) -> Result<Session, AppError> {
    let session = state
        .sessions
        .get_by_id(session_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Session not found".into()))?;
    if session.user_id != user.user_id {
        return Err(AppError::Forbidden("Forbidden".into()));
    }
    Ok(session)
}

pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<SessionResponse>>, AppError> {
    let now = Utc::now();
    let sessions = state.sessions.get_active_for_user(user.user_id).await?;
    Ok(Json(
        sessions
            .into_iter()
            .map(|session| SessionResponse::from_session(session, user.session_id, now))
            .collect(),
    ))
}

pub async fn list_devices(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Vec<DeviceGroupResponse>>, AppError> {
    let now = Utc::now();
    let groups = state
        .sessions
        .get_active_grouped_by_device(user.user_id)
        .await?;
    Ok(Json(
        groups
            .into_iter()
            .map(|group| DeviceGroupResponse::from_group(group, user.session_id, now))
            .collect(),
    ))
}

pub async fn create_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionResponse>), AppError> {
    let device_id = payload
        .device_id
        .or_else(|| extract_device_id(&headers))
        .ok_or_else(|| AppError::BadRequest("Device id is required".into()))?;

    let session = state
        .sessions
        .create(CreateSessionDto {
            user_id: user.user_id,
            device_id,
            device_name: payload.device_name,
            user_agent: payload.user_agent.or_else(|| extract_user_agent(&headers)),
            ip_address: payload.ip_address.or_else(|| extract_ip(&headers)),
            geolocation: payload.geolocation,
            refresh_token_reference_id: None,
            token_expires_at: payload.token_expires_at,
        })
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(SessionResponse::from_session(
            session,
            user.session_id,
            Utc::now(),
        )),
    ))
}

pub async fn get_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<SessionResponse>, AppError> {
    let session = load_owned_session(&state, &user, session_id).await?;
    Ok(Json(SessionResponse::from_session(
        session,
        user.session_id,
        Utc::now(),
    )))
}

pub async fn update_activity(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<SessionId>,
) -> Result<StatusCode, AppError> {
    load_owned_session(&state, &user, session_id).await?;
    state.sessions.update_activity(session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn revoke_session(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Path(session_id): Path<SessionId>,
) -> Result<Json<Value>, AppError> {
    load_owned_session(&state, &user, session_id).await?;
    if session_id == user.session_id {
        return Err(AppError::BadRequest(
            "Cannot revoke current session; use logout instead".into(),
        ));
    }

    let revoked = state
        .issuance
        .revoke_session(session_id, USER_REVOKE_REASON)
        .await?;

    let message = if revoked {
        "Session revoked"
    } else {
        "Session already revoked"
    };
    Ok(Json(json!({
        "message": message,
        "session_id": session_id,
        "revoked": revoked
    })))
}

pub async fn revoke_other_sessions(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
) -> Result<Json<Value>, AppError> {
    let revoked_count = state
        .issuance
        .revoke_other_sessions(user.user_id, user.session_id)
        .await?;
    Ok(Json(json!({
        "message": "Other sessions revoked",
        "revoked_count": revoked_count
    })))
}
