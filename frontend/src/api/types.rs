use chrono::{DateTime, Utc};
use lessonhub_resilience::Retryable;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginStartResponse {
    pub authorize_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub code: String,
    pub state: String,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginResponse {
    pub session_id: String,
    pub user_id: String,
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub refresh_handle: String,
    pub user: UserClaims,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub session_id: String,
    pub refresh_handle: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    pub user_id: String,
    pub session_id: String,
    pub claims: Option<UserClaims>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Geolocation {
    pub country: Option<String>,
    pub city: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub id: String,
    pub device_id: String,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    #[serde(default)]
    pub is_current: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroupResponse {
    pub device_id: String,
    pub device_name: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub is_current: bool,
    pub sessions: Vec<SessionResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeSessionResponse {
    pub message: String,
    pub session_id: String,
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevokeOthersResponse {
    pub message: String,
    pub revoked_count: u64,
}

/// Error body returned by the API, plus the HTTP status it came with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiError {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(skip)]
    pub status: Option<u16>,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl std::error::Error for ApiError {}

impl From<ApiError> for String {
    fn from(error: ApiError) -> Self {
        error.error
    }
}

impl ApiError {
    fn with_code(msg: impl Into<String>, code: &str) -> Self {
        Self {
            error: msg.into(),
            code: code.to_string(),
            details: None,
            status: None,
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_code(msg, "VALIDATION_ERROR")
    }

    pub fn unknown(msg: impl Into<String>) -> Self {
        Self::with_code(msg, "UNKNOWN")
    }

    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::with_code(msg, "REQUEST_FAILED")
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::with_code(msg, "TIMEOUT")
    }

    pub fn login_required(login_url: impl Into<String>) -> Self {
        Self {
            details: Some(serde_json::json!({ "login_url": login_url.into() })),
            status: Some(401),
            ..Self::with_code("Login required", "LOGIN_REQUIRED")
        }
    }

    /// Builds the error for a non-success response, falling back to the
    /// status line when the body is not an API error document.
    pub fn from_response_body(status: u16, body: &str) -> Self {
        match serde_json::from_str::<ApiError>(body) {
            Ok(parsed) => Self {
                status: Some(status),
                ..parsed
            },
            Err(_) => Self {
                status: Some(status),
                ..Self::with_code(format!("Request failed with status {status}"), "HTTP_ERROR")
            },
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == Some(401)
    }

    pub fn is_login_required(&self) -> bool {
        self.code == "LOGIN_REQUIRED"
    }
}

impl Retryable for ApiError {
    fn status_code(&self) -> Option<u16> {
        self.status
    }

    fn is_transient(&self) -> bool {
        match self.status {
            Some(status) => status >= 500,
            None => matches!(self.code.as_str(), "REQUEST_FAILED" | "TIMEOUT"),
        }
    }
}
