use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;

use crate::services::{session_lifecycle::SessionError, AuthError};

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug)]
pub enum AppError {
    NotFound(String),
    Unauthorized(String),
    /// The session cannot be refreshed; the client must restart the login flow.
    LoginRequired { login_url: String },
    Forbidden(String),
    Conflict(String),
    BadRequest(String),
    ServiceUnavailable(String),
    /// An upstream dependency answered with something unusable.
    BadGateway(String),
    InternalServerError(anyhow::Error),
    Validation(Vec<String>),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, code, details) = match self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "NOT_FOUND".to_string(), None),
            AppError::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                msg,
                "UNAUTHORIZED".to_string(),
                None,
            ),
            AppError::LoginRequired { login_url } => (
                StatusCode::UNAUTHORIZED,
                "Login required".to_string(),
                "LOGIN_REQUIRED".to_string(),
                Some(serde_json::json!({ "login_url": login_url })),
            ),
            AppError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "FORBIDDEN".to_string(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg, "CONFLICT".to_string(), None),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                msg,
                "BAD_REQUEST".to_string(),
                None,
            ),
            AppError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                msg,
                "SERVICE_UNAVAILABLE".to_string(),
                None,
            ),
            AppError::BadGateway(msg) => (
                StatusCode::BAD_GATEWAY,
                msg,
                "BAD_GATEWAY".to_string(),
                None,
            ),
            AppError::InternalServerError(err) => {
                tracing::error!("Internal server error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    "INTERNAL_SERVER_ERROR".to_string(),
                    None,
                )
            }
            AppError::Validation(errors) => (
                StatusCode::BAD_REQUEST,
                "Validation failed".to_string(),
                "VALIDATION_ERROR".to_string(),
                Some(serde_json::json!({ "errors": errors })),
            ),
        };

        let body = Json(ErrorResponse {
            error: error_message,
            code,
            details,
        });

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalServerError(err)
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::InternalServerError(err.into()),
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let messages: Vec<String> = errors
            .field_errors()
            .into_iter()
            .flat_map(|(field, errs)| {
                errs.iter().map(move |e| {
                    let code = e.code.as_ref();
                    format!("{}: {}", field, code)
                })
            })
            .collect();
        AppError::Validation(messages)
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => AppError::NotFound("Session not found".to_string()),
            SessionError::Validation(errors) => errors.into(),
            SessionError::Storage(err) => err.into(),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TransientNetwork(err) => {
                tracing::warn!(error = %err, "Identity provider unavailable");
                AppError::ServiceUnavailable("Identity provider unavailable".to_string())
            }
            AuthError::AuthenticationExpired => {
                AppError::Unauthorized("Authentication expired".to_string())
            }
            AuthError::RefreshExhausted { login_url } => AppError::LoginRequired { login_url },
            AuthError::ReplayedAuthorizationCode => AppError::BadRequest(
                "Authorization code already used or expired; restart the login flow".to_string(),
            ),
            AuthError::InvalidRefreshHandle => {
                AppError::Unauthorized("Invalid refresh handle".to_string())
            }
            AuthError::SessionNotFound(_) => AppError::NotFound("Session not found".to_string()),
            AuthError::Session(err) => err.into(),
            AuthError::Unavailable => {
                AppError::ServiceUnavailable("Token service shutting down".to_string())
            }
            AuthError::Idp(err) => {
                tracing::error!(error = %err, "Identity provider request failed");
                AppError::BadGateway("Identity provider request failed".to_string())
            }
        }
    }
}
