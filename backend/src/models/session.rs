//! Models for tracking authenticated sessions per user and device.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use crate::types::{SessionId, UserId};

/// Reason stamped on sessions revoked by "log out other devices".
pub const BULK_REVOCATION_REASON: &str = "Bulk revocation";
/// Reason stamped on sessions ended through the logout endpoint.
pub const USER_LOGOUT_REASON: &str = "User logout";

/// Stored lifecycle status. Every revoked variant is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Revoked,
    RevokedBySecurityEvent,
    RevokedByTokenInvalidation,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Active)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Revoked => "revoked",
            SessionStatus::RevokedBySecurityEvent => "revoked_by_security_event",
            SessionStatus::RevokedByTokenInvalidation => "revoked_by_token_invalidation",
        }
    }
}

/// Status as seen by readers: `Expired` is derived from `token_expires_at`
/// and never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveStatus {
    Active,
    Expired,
    Revoked,
    RevokedBySecurityEvent,
    RevokedByTokenInvalidation,
}

impl From<SessionStatus> for EffectiveStatus {
    fn from(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Active => EffectiveStatus::Active,
            SessionStatus::Revoked => EffectiveStatus::Revoked,
            SessionStatus::RevokedBySecurityEvent => EffectiveStatus::RevokedBySecurityEvent,
            SessionStatus::RevokedByTokenInvalidation => {
                EffectiveStatus::RevokedByTokenInvalidation
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Geolocation {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// One authenticated session of a user on a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    /// Stable per-browser identifier minted by the client.
    pub device_id: String,
    pub device_name: Option<String>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub status: SessionStatus,
    /// Reference to the refresh token currently bound to the session.
    pub refresh_token_reference_id: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    /// Bumped on every status change.
    pub version: i64,
}

impl Session {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Active status and a token expiry that has not passed.
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.status == SessionStatus::Active
            && self.token_expires_at.map_or(true, |expires| expires > now)
    }

    pub fn effective_status(&self, now: DateTime<Utc>) -> EffectiveStatus {
        match self.status {
            SessionStatus::Active if !self.is_active_at(now) => EffectiveStatus::Expired,
            status => status.into(),
        }
    }
}

/// Everything needed to open a session.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateSessionDto {
    pub user_id: UserId,
    #[validate(length(min = 1, max = 128))]
    pub device_id: String,
    #[validate(length(max = 128))]
    pub device_name: Option<String>,
    #[validate(length(max = 512))]
    pub user_agent: Option<String>,
    #[validate(length(max = 64))]
    pub ip_address: Option<String>,
    pub geolocation: Option<Geolocation>,
    pub refresh_token_reference_id: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
}

/// Active sessions of one device, most recent first.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DeviceSessionGroup {
    pub device_id: String,
    pub device_name: Option<String>,
    pub last_activity_at: DateTime<Utc>,
    pub sessions: Vec<Session>,
}
