#![allow(dead_code)] // OpenAPI doc stubs are only referenced by utoipa macros.

use axum::Json;
use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};

use crate::{
    handlers::{
        auth::{CallbackRequest, LoginResponse, MeResponse, RefreshRequest},
        sessions::{CreateSessionRequest, DeviceGroupResponse, SessionResponse},
    },
    models::session::{EffectiveStatus, Geolocation, SessionStatus},
    services::{
        identity_provider::UserClaims,
        token_issuance::{IssuedAccessToken, LoginStart},
    },
    types::{SessionId, UserId},
};

#[derive(OpenApi)]
#[openapi(
    paths(
        begin_login_doc,
        callback_doc,
        refresh_doc,
        logout_doc,
        me_doc,
        list_sessions_doc,
        list_devices_doc,
        create_session_doc,
        get_session_doc,
        update_activity_doc,
        revoke_session_doc,
        revoke_other_sessions_doc
    ),
    components(
        schemas(
            // auth
            LoginStart,
            CallbackRequest,
            LoginResponse,
            RefreshRequest,
            IssuedAccessToken,
            MeResponse,
            UserClaims,
            // sessions
            SessionId,
            UserId,
            SessionStatus,
            EffectiveStatus,
            Geolocation,
            CreateSessionRequest,
            SessionResponse,
            DeviceGroupResponse
        )
    ),
    modifiers(&SecuritySchemes),
    tags(
        (name = "Auth", description = "Login, token refresh and logout"),
        (name = "Sessions", description = "Session and device management")
    ),
    security(("BearerAuth" = []))
)]
pub struct ApiDoc;

struct SecuritySchemes;

impl Modify for SecuritySchemes {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_default();
        components.add_security_scheme(
            "BearerAuth",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

/// Serves the generated document at `/api/docs/openapi.json`.
pub async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/api/auth/login",
    responses((status = 200, description = "Authorize URL and state", body = LoginStart)),
    tag = "Auth",
    security(())
)]
fn begin_login_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/callback",
    request_body = CallbackRequest,
    responses(
        (status = 200, description = "Session opened", body = LoginResponse),
        (status = 400, description = "Code replayed or expired; restart login"),
        (status = 503, description = "Identity provider unavailable")
    ),
    tag = "Auth",
    security(())
)]
fn callback_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/refresh",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "Usable access token", body = IssuedAccessToken),
        (status = 401, description = "LOGIN_REQUIRED or invalid refresh handle"),
        (status = 404, description = "Unknown session")
    ),
    tag = "Auth",
    security(())
)]
fn refresh_doc() {}

#[utoipa::path(
    post,
    path = "/api/auth/logout",
    responses((status = 200, body = serde_json::Value)),
    tag = "Auth"
)]
fn logout_doc() {}

#[utoipa::path(
    get,
    path = "/api/auth/me",
    responses((status = 200, body = MeResponse)),
    tag = "Auth"
)]
fn me_doc() {}

#[utoipa::path(
    get,
    path = "/api/sessions",
    responses((status = 200, description = "Active sessions, most recent first", body = [SessionResponse])),
    tag = "Sessions"
)]
fn list_sessions_doc() {}

#[utoipa::path(
    get,
    path = "/api/sessions/devices",
    responses((status = 200, description = "Active sessions grouped by device", body = [DeviceGroupResponse])),
    tag = "Sessions"
)]
fn list_devices_doc() {}

#[utoipa::path(
    post,
    path = "/api/sessions",
    request_body = CreateSessionRequest,
    responses((status = 201, body = SessionResponse)),
    tag = "Sessions"
)]
fn create_session_doc() {}

#[utoipa::path(
    get,
    path = "/api/sessions/{id}",
    params(("id" = SessionId, Path, description = "Session id")),
    responses(
        (status = 200, body = SessionResponse),
        (status = 403, description = "Session belongs to another user"),
        (status = 404, description = "Unknown session")
    ),
    tag = "Sessions"
)]
fn get_session_doc() {}

#[utoipa::path(
    post,
    path = "/api/sessions/{id}/activity",
    params(("id" = SessionId, Path, description = "Session id")),
    responses((status = 204, description = "Activity recorded")),
    tag = "Sessions"
)]
fn update_activity_doc() {}

#[utoipa::path(
    delete,
    path = "/api/sessions/{id}",
    params(("id" = SessionId, Path, description = "Session id")),
    responses(
        (status = 200, body = serde_json::Value),
        (status = 400, description = "Current session; use logout")
    ),
    tag = "Sessions"
)]
fn revoke_session_doc() {}

#[utoipa::path(
    post,
    path = "/api/sessions/revoke-others",
    responses((status = 200, body = serde_json::Value)),
    tag = "Sessions"
)]
fn revoke_other_sessions_doc() {}
