//! Session persistence.
//!
//! Status changes only ever move a row out of `active`; every write that
//! changes status is guarded by `status = 'active'` and bumps `version`, so a
//! revocation that loses a race reports "nothing changed" instead of
//! overwriting a terminal state.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use tokio::sync::RwLock;

use crate::models::session::{Geolocation, Session, SessionStatus};
use crate::types::{SessionId, UserId};

const SESSION_COLUMNS: &str = "id, user_id, device_id, device_name, user_agent, ip_address, \
     geo_country, geo_city, status, refresh_token_reference_id, token_expires_at, created_at, \
     last_activity_at, revoked_at, revocation_reason, version";

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn insert(&self, session: &Session) -> Result<Session, sqlx::Error>;

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, sqlx::Error>;

    /// Active, unexpired sessions of `user_id`, most recent activity first.
    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, sqlx::Error>;

    /// Sets `last_activity_at`. Returns false when the session does not exist.
    async fn touch(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool, sqlx::Error>;

    /// Moves an active session to `to`. Returns `None` when the session is
    /// missing or no longer active.
    async fn transition_from_active(
        &self,
        id: SessionId,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Session>, sqlx::Error>;

    /// Moves every stored-active session of `user_id` except `exclude` to `to`
    /// and returns the ids that changed.
    async fn revoke_active_for_user_except(
        &self,
        user_id: UserId,
        exclude: Option<SessionId>,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<SessionId>, sqlx::Error>;

    /// Rebinds an active session to a rotated refresh token.
    async fn rotate_tokens(
        &self,
        id: SessionId,
        refresh_token_reference_id: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error>;
}

#[derive(Debug, FromRow)]
struct SessionRow {
    id: SessionId,
    user_id: UserId,
    device_id: String,
    device_name: Option<String>,
    user_agent: Option<String>,
    ip_address: Option<String>,
    geo_country: Option<String>,
    geo_city: Option<String>,
    status: SessionStatus,
    refresh_token_reference_id: Option<String>,
    token_expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    revoked_at: Option<DateTime<Utc>>,
    revocation_reason: Option<String>,
    version: i64,
}

impl From<SessionRow> for Session {
    fn from(row: SessionRow) -> Self {
        let geolocation = if row.geo_country.is_some() || row.geo_city.is_some() {
            Some(Geolocation {
                country: row.geo_country,
                city: row.geo_city,
            })
        } else {
            None
        };

        Session {
            id: row.id,
            user_id: row.user_id,
            device_id: row.device_id,
            device_name: row.device_name,
            user_agent: row.user_agent,
            ip_address: row.ip_address,
            geolocation,
            status: row.status,
            refresh_token_reference_id: row.refresh_token_reference_id,
            token_expires_at: row.token_expires_at,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            revoked_at: row.revoked_at,
            revocation_reason: row.revocation_reason,
            version: row.version,
        }
    }
}

#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    async fn insert(&self, session: &Session) -> Result<Session, sqlx::Error> {
        let (geo_country, geo_city) = session
            .geolocation
            .as_ref()
            .map(|geo| (geo.country.as_deref(), geo.city.as_deref()))
            .unwrap_or((None, None));

        let query = format!(
            r#"
            INSERT INTO sessions
                (id, user_id, device_id, device_name, user_agent, ip_address, geo_country,
                 geo_city, status, refresh_token_reference_id, token_expires_at, created_at,
                 last_activity_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            RETURNING {SESSION_COLUMNS}
            "#
        );
        sqlx::query_as::<_, SessionRow>(&query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.device_id)
            .bind(session.device_name.as_deref())
            .bind(session.user_agent.as_deref())
            .bind(session.ip_address.as_deref())
            .bind(geo_country)
            .bind(geo_city)
            .bind(session.status)
            .bind(session.refresh_token_reference_id.as_deref())
            .bind(session.token_expires_at)
            .bind(session.created_at)
            .bind(session.last_activity_at)
            .bind(session.version)
            .fetch_one(&self.pool)
            .await
            .map(Session::from)
    }

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, sqlx::Error> {
        let query = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1");
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Session::from))
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, sqlx::Error> {
        let query = format!(
            r#"
            SELECT {SESSION_COLUMNS}
            FROM sessions
            WHERE user_id = $1
              AND status = 'active'
              AND (token_expires_at IS NULL OR token_expires_at > $2)
            ORDER BY last_activity_at DESC, created_at DESC, id DESC
            "#
        );
        let rows = sqlx::query_as::<_, SessionRow>(&query)
            .bind(user_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().map(Session::from).collect())
    }

    async fn touch(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET last_activity_at = GREATEST(last_activity_at, $1)
            WHERE id = $2
            "#,
        )
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition_from_active(
        &self,
        id: SessionId,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        let query = format!(
            r#"
            UPDATE sessions
            SET status = $1,
                revoked_at = $2,
                revocation_reason = $3,
                version = version + 1
            WHERE id = $4 AND status = 'active'
            RETURNING {SESSION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, SessionRow>(&query)
            .bind(to)
            .bind(at)
            .bind(reason)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Session::from))
    }

    async fn revoke_active_for_user_except(
        &self,
        user_id: UserId,
        exclude: Option<SessionId>,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<SessionId>, sqlx::Error> {
        sqlx::query_scalar::<_, SessionId>(
            r#"
            UPDATE sessions
            SET status = $1,
                revoked_at = $2,
                revocation_reason = $3,
                version = version + 1
            WHERE user_id = $4
              AND status = 'active'
              AND ($5::uuid IS NULL OR id <> $5)
            RETURNING id
            "#,
        )
        .bind(to)
        .bind(at)
        .bind(reason)
        .bind(user_id)
        .bind(exclude)
        .fetch_all(&self.pool)
        .await
    }

    async fn rotate_tokens(
        &self,
        id: SessionId,
        refresh_token_reference_id: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            r#"
            UPDATE sessions
            SET refresh_token_reference_id = $1,
                token_expires_at = $2,
                last_activity_at = GREATEST(last_activity_at, $3)
            WHERE id = $4 AND status = 'active'
            "#,
        )
        .bind(refresh_token_reference_id)
        .bind(token_expires_at)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Process-local store used for `SESSION_STORE=memory` and in tests.
#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

fn revoke_in_place(session: &mut Session, to: SessionStatus, at: DateTime<Utc>, reason: &str) {
    session.status = to;
    session.revoked_at = Some(at);
    session.revocation_reason = Some(reason.to_string());
    session.version += 1;
}

#[async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn insert(&self, session: &Session) -> Result<Session, sqlx::Error> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(sqlx::Error::Protocol(format!(
                "duplicate session id {}",
                session.id
            )));
        }
        sessions.insert(session.id, session.clone());
        Ok(session.clone())
    }

    async fn find_by_id(&self, id: SessionId) -> Result<Option<Session>, sqlx::Error> {
        Ok(self.sessions.read().await.get(&id).cloned())
    }

    async fn list_active_for_user(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, sqlx::Error> {
        let sessions = self.sessions.read().await;
        let mut active: Vec<Session> = sessions
            .values()
            .filter(|s| s.user_id == user_id && s.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| {
            b.last_activity_at
                .cmp(&a.last_activity_at)
                .then(b.created_at.cmp(&a.created_at))
                .then(b.id.cmp(&a.id))
        });
        Ok(active)
    }

    async fn touch(&self, id: SessionId, at: DateTime<Utc>) -> Result<bool, sqlx::Error> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) => {
                session.last_activity_at = session.last_activity_at.max(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition_from_active(
        &self,
        id: SessionId,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Option<Session>, sqlx::Error> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.status == SessionStatus::Active => {
                revoke_in_place(session, to, at, reason);
                Ok(Some(session.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn revoke_active_for_user_except(
        &self,
        user_id: UserId,
        exclude: Option<SessionId>,
        to: SessionStatus,
        at: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<SessionId>, sqlx::Error> {
        let mut sessions = self.sessions.write().await;
        let mut revoked = Vec::new();
        for session in sessions.values_mut() {
            if session.user_id != user_id
                || session.status != SessionStatus::Active
                || Some(session.id) == exclude
            {
                continue;
            }
            revoke_in_place(session, to, at, reason);
            revoked.push(session.id);
        }
        Ok(revoked)
    }

    async fn rotate_tokens(
        &self,
        id: SessionId,
        refresh_token_reference_id: Option<&str>,
        token_expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> Result<bool, sqlx::Error> {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(&id) {
            Some(session) if session.status == SessionStatus::Active => {
                session.refresh_token_reference_id = refresh_token_reference_id.map(str::to_string);
                session.token_expires_at = token_expires_at;
                session.last_activity_at = session.last_activity_at.max(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
