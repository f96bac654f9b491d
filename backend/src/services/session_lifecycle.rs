//! Session lifecycle: creation, activity tracking, device grouping and the
//! revocation state machine.
//!
//! `Active` may move to any revoked status; revoked statuses never move
//! again. Revoking a session that is already terminal is a no-op that
//! returns `false`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use validator::Validate;

use crate::models::session::{
    CreateSessionDto, DeviceSessionGroup, Session, SessionStatus, BULK_REVOCATION_REASON,
};
use crate::repositories::session::SessionRepository;
use crate::types::{SessionId, UserId};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error(transparent)]
    Validation(#[from] validator::ValidationErrors),
    #[error("session storage failure: {0}")]
    Storage(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct SessionService {
    repository: Arc<dyn SessionRepository>,
}

impl SessionService {
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        Self { repository }
    }

    #[tracing::instrument(skip_all, fields(user_id = %dto.user_id, device_id = %dto.device_id))]
    pub async fn create(&self, dto: CreateSessionDto) -> Result<Session, SessionError> {
        dto.validate()?;
        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            user_id: dto.user_id,
            device_id: dto.device_id,
            device_name: dto.device_name,
            user_agent: dto.user_agent,
            ip_address: dto.ip_address,
            geolocation: dto.geolocation,
            status: SessionStatus::Active,
            refresh_token_reference_id: dto.refresh_token_reference_id,
            token_expires_at: dto.token_expires_at,
            created_at: now,
            last_activity_at: now,
            revoked_at: None,
            revocation_reason: None,
            version: 0,
        };
        let session = self.repository.insert(&session).await?;
        tracing::info!(session_id = %session.id, "Session created");
        Ok(session)
    }

    pub async fn get_by_id(&self, session_id: SessionId) -> Result<Option<Session>, SessionError> {
        Ok(self.repository.find_by_id(session_id).await?)
    }

    pub async fn get_active_for_user(&self, user_id: UserId) -> Result<Vec<Session>, SessionError> {
        Ok(self
            .repository
            .list_active_for_user(user_id, Utc::now())
            .await?)
    }

    pub async fn get_active_grouped_by_device(
        &self,
        user_id: UserId,
    ) -> Result<Vec<DeviceSessionGroup>, SessionError> {
        let sessions = self.get_active_for_user(user_id).await?;
        Ok(group_by_device(sessions))
    }

    /// Bumps `last_activity_at`. Never touches status.
    pub async fn update_activity(&self, session_id: SessionId) -> Result<(), SessionError> {
        if self.repository.touch(session_id, Utc::now()).await? {
            Ok(())
        } else {
            Err(SessionError::NotFound(session_id))
        }
    }

    pub async fn revoke(&self, session_id: SessionId, reason: &str) -> Result<bool, SessionError> {
        self.transition(session_id, SessionStatus::Revoked, reason)
            .await
    }

    pub async fn revoke_for_security_event(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<bool, SessionError> {
        self.transition(session_id, SessionStatus::RevokedBySecurityEvent, reason)
            .await
    }

    pub async fn revoke_for_token_invalidation(
        &self,
        session_id: SessionId,
        reason: &str,
    ) -> Result<bool, SessionError> {
        self.transition(
            session_id,
            SessionStatus::RevokedByTokenInvalidation,
            reason,
        )
        .await
    }

    /// Revokes every active session of `user_id` except `exclude`.
    /// Returns the number of sessions that changed.
    pub async fn revoke_all(
        &self,
        user_id: UserId,
        exclude: Option<SessionId>,
    ) -> Result<u64, SessionError> {
        Ok(self.revoke_all_returning_ids(user_id, exclude).await?.len() as u64)
    }

    /// Same as [`Self::revoke_all`] but returns the ids that changed.
    #[tracing::instrument(skip(self))]
    pub async fn revoke_all_returning_ids(
        &self,
        user_id: UserId,
        exclude: Option<SessionId>,
    ) -> Result<Vec<SessionId>, SessionError> {
        let revoked = self
            .repository
            .revoke_active_for_user_except(
                user_id,
                exclude,
                SessionStatus::Revoked,
                Utc::now(),
                BULK_REVOCATION_REASON,
            )
            .await?;
        tracing::info!(count = revoked.len(), "Sessions revoked in bulk");
        Ok(revoked)
    }

    /// Binds the session to a rotated refresh token and bumps activity.
    /// Returns false when the session is no longer active.
    pub async fn rotate_tokens(
        &self,
        session_id: SessionId,
        refresh_token_reference_id: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool, SessionError> {
        Ok(self
            .repository
            .rotate_tokens(
                session_id,
                refresh_token_reference_id,
                token_expires_at,
                Utc::now(),
            )
            .await?)
    }

    async fn transition(
        &self,
        session_id: SessionId,
        to: SessionStatus,
        reason: &str,
    ) -> Result<bool, SessionError> {
        let current = self
            .repository
            .find_by_id(session_id)
            .await?
            .ok_or(SessionError::NotFound(session_id))?;
        if current.is_terminal() {
            return Ok(false);
        }

        match self
            .repository
            .transition_from_active(session_id, to, Utc::now(), reason)
            .await?
        {
            Some(session) => {
                tracing::info!(
                    %session_id,
                    status = session.status.as_str(),
                    reason,
                    "Session revoked"
                );
                Ok(true)
            }
            // Another writer revoked it between the read and the guarded update.
            None => Ok(false),
        }
    }
}

/// Groups sessions by device. Sessions inside a group and the groups
/// themselves are ordered by most recent activity first.
pub fn group_by_device(sessions: Vec<Session>) -> Vec<DeviceSessionGroup> {
    let mut by_device: HashMap<String, Vec<Session>> = HashMap::new();
    for session in sessions {
        by_device
            .entry(session.device_id.clone())
            .or_default()
            .push(session);
    }

    let mut groups: Vec<DeviceSessionGroup> = by_device
        .into_iter()
        .filter_map(|(device_id, mut sessions)| {
            sessions.sort_by(|a, b| {
                b.last_activity_at
                    .cmp(&a.last_activity_at)
                    .then(b.created_at.cmp(&a.created_at))
            });
            let last_activity_at = sessions.first()?.last_activity_at;
            let device_name = sessions.iter().find_map(|s| s.device_name.clone());
            Some(DeviceSessionGroup {
                device_id,
                device_name,
                last_activity_at,
                sessions,
            })
        })
        .collect();
    groups.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.device_id.cmp(&b.device_id))
    });
    groups
}
