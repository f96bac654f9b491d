use reqwest::Method;

use super::{
    client::{decode, ApiClient, Call},
    types::{ApiError, CallbackRequest, LoginResponse, LoginStartResponse, MeResponse},
};
use crate::auth::device;
use crate::utils::storage::{
    self as storage_utils, Storage, ACCESS_TOKEN_EXPIRES_AT_KEY, ACCESS_TOKEN_KEY,
    CURRENT_USER_KEY, REFRESH_HANDLE_KEY, SESSION_ID_KEY,
};

pub(crate) fn persist_session(storage: &dyn Storage, login: &LoginResponse) {
    storage.set_item(SESSION_ID_KEY, &login.session_id);
    storage.set_item(ACCESS_TOKEN_KEY, &login.access_token);
    storage.set_item(ACCESS_TOKEN_EXPIRES_AT_KEY, &login.expires_at.to_rfc3339());
    storage.set_item(REFRESH_HANDLE_KEY, &login.refresh_handle);
    if let Ok(user) = serde_json::to_string(&login.user) {
        storage.set_item(CURRENT_USER_KEY, &user);
    }
}

impl ApiClient {
    pub async fn begin_login(&self) -> Result<LoginStartResponse, ApiError> {
        let response = self
            .send_public(Call::new(Method::GET, "/auth/login"))
            .await?;
        decode(response).await
    }

    /// Finishes the provider round trip. This is the one place a device id
    /// gets minted.
    pub async fn complete_login(
        &self,
        code: &str,
        state: &str,
        device_name: Option<String>,
    ) -> Result<LoginResponse, ApiError> {
        if code.trim().is_empty() || state.trim().is_empty() {
            return Err(ApiError::validation("Authorization code and state are required"));
        }

        let request = CallbackRequest {
            code: code.to_string(),
            state: state.to_string(),
            device_id: device::ensure_device_id(self.storage.as_ref()),
            device_name,
        };
        let body = serde_json::to_value(&request)
            .map_err(|e| ApiError::unknown(format!("Failed to encode request: {}", e)))?;
        let response = self
            .send_public(Call::new(Method::POST, "/auth/callback").body(Some(&body)))
            .await?;
        let login: LoginResponse = decode(response).await?;

        persist_session(self.storage.as_ref(), &login);
        log::info!("Signed in; session {}", login.session_id);
        Ok(login)
    }

    /// Cheap "am I still signed in" probe. Never refreshes, never retries and
    /// gives up after the session-check timeout; any failure reads as
    /// signed out.
    pub async fn check_session(&self) -> Option<MeResponse> {
        let token = self.coordinator.access_token()?;
        let limit = self.config.session_check_timeout;
        let call = Call::new(Method::GET, "/auth/me")
            .bearer(Some(&token))
            .probe(limit);

        let outcome = tokio::time::timeout(limit, async {
            let response = self.transport.send(&call).await?;
            decode::<MeResponse>(response).await
        })
        .await;

        match outcome {
            Ok(Ok(me)) => {
                if let Some(claims) = &me.claims {
                    if let Ok(user) = serde_json::to_string(claims) {
                        self.storage.set_item(CURRENT_USER_KEY, &user);
                    }
                }
                Some(me)
            }
            Ok(Err(err)) => {
                log::debug!("Session check failed: {}", err);
                None
            }
            Err(_) => {
                log::debug!("Session check timed out after {:?}", limit);
                None
            }
        }
    }

    pub async fn me(&self) -> Result<MeResponse, ApiError> {
        self.get_json("/auth/me").await
    }

    /// Revokes the session server-side when possible. Local credentials are
    /// cleared either way.
    pub async fn logout(&self) -> Result<(), ApiError> {
        let result = match self.coordinator.access_token() {
            Some(token) => self
                .transport
                .send(&Call::new(Method::POST, "/auth/logout").bearer(Some(&token)))
                .await
                .map(|_| ()),
            None => Ok(()),
        };

        storage_utils::clear_auth_session(self.storage.as_ref());
        if let Err(err) = &result {
            log::warn!("Server-side logout failed: {}", err);
        }
        result
    }
}
