use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use lessonhub_resilience::{current_context, scope};

use crate::{
    error::AppError,
    state::AppState,
    types::{SessionId, UserId},
};

/// Identity attached to requests that passed [`auth`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub session_id: SessionId,
}

/// Requires a bearer token that is the current access token of an active
/// session. Activity is bumped in the background.
pub async fn auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let token = extract_bearer_token(request.headers())
        .ok_or_else(|| AppError::Unauthorized("Missing bearer token".to_string()))?;
    let identity = state.issuance.authenticate(&token).await?;

    let now = Utc::now();
    state
        .sessions
        .get_by_id(identity.session_id)
        .await?
        .filter(|session| session.is_active_at(now))
        .ok_or_else(|| AppError::Unauthorized("Session is no longer active".to_string()))?;

    let sessions = state.sessions.clone();
    let session_id = identity.session_id;
    tokio::spawn(scope(current_context(), async move {
        if let Err(err) = sessions.update_activity(session_id).await {
            tracing::warn!(%session_id, error = %err, "Failed to record session activity");
        }
    }));

    request.extensions_mut().insert(AuthenticatedUser {
        user_id: identity.user_id,
        session_id: identity.session_id,
    });
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_bearer_token)
        .map(str::to_string)
}

fn parse_bearer_token(header: &str) -> Option<&str> {
    let (scheme, rest) = header.trim().split_once(' ')?;
    let token = rest.trim_start();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}
