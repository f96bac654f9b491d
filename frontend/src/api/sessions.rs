use reqwest::Method;
use serde_json::json;

use super::{
    client::{decode, ApiClient},
    types::{
        ApiError, DeviceGroupResponse, RevokeOthersResponse, RevokeSessionResponse,
        SessionResponse,
    },
};

impl ApiClient {
    pub async fn list_sessions(&self) -> Result<Vec<SessionResponse>, ApiError> {
        self.get_json("/sessions").await
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceGroupResponse>, ApiError> {
        self.get_json("/sessions/devices").await
    }

    pub async fn get_session(&self, session_id: &str) -> Result<SessionResponse, ApiError> {
        self.get_json(&format!("/sessions/{}", session_id)).await
    }

    pub async fn update_activity(&self, session_id: &str) -> Result<(), ApiError> {
        self.send_authorized(
            Method::POST,
            &format!("/sessions/{}/activity", session_id),
            None,
        )
        .await
        .map(|_| ())
    }

    pub async fn revoke_session(&self, session_id: &str) -> Result<RevokeSessionResponse, ApiError> {
        let response = self
            .send_authorized(Method::DELETE, &format!("/sessions/{}", session_id), None)
            .await?;
        decode(response).await
    }

    pub async fn revoke_other_sessions(&self) -> Result<RevokeOthersResponse, ApiError> {
        self.post_json("/sessions/revoke-others", &json!({})).await
    }
}
