use axum::http::StatusCode;
use serde_json::json;

mod support;

use support::{delete, get, login, mock_identity_provider, post_json, send, test_app};

#[tokio::test]
async fn login_opens_an_active_session_for_the_device() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let login = login(&app.router, "device-a").await;
    assert_eq!(login["token_type"], "Bearer");
    assert_eq!(login["access_token"], "access-1");
    assert_eq!(login["user"]["email"], "learner@example.com");
    assert!(login["refresh_handle"].as_str().is_some_and(|h| !h.is_empty()));

    let token = login["access_token"].as_str().unwrap();
    let (status, sessions) = send(&app.router, get("/api/sessions", Some(token))).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = sessions.as_array().expect("session list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["device_id"], "device-a");
    assert_eq!(sessions[0]["status"], "active");
    assert_eq!(sessions[0]["is_current"], true);
    assert!(sessions[0]["token_expires_at"].is_string());

    let (status, me) = send(&app.router, get("/api/auth/me", Some(token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(me["session_id"], login["session_id"]);
    assert_eq!(me["claims"]["name"], "Test Learner");
}

#[tokio::test]
async fn revoke_others_keeps_only_the_current_session() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let b = login(&app.router, "device-b").await;
    let token_a = a["access_token"].as_str().unwrap();
    let token_b = b["access_token"].as_str().unwrap();

    let (status, devices) = send(&app.router, get("/api/sessions/devices", Some(token_a))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(devices.as_array().map(Vec::len), Some(2));

    let (status, body) = send(
        &app.router,
        post_json("/api/sessions/revoke-others", Some(token_a), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked_count"], 1);

    let uri = format!("/api/sessions/{}", b["session_id"].as_str().unwrap());
    let (status, session_b) = send(&app.router, get(&uri, Some(token_a))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(session_b["status"], "revoked");
    assert_eq!(session_b["revocation_reason"], "Bulk revocation");

    let (status, _) = send(&app.router, get("/api/auth/me", Some(token_b))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, sessions) = send(&app.router, get("/api/sessions", Some(token_a))).await;
    assert_eq!(status, StatusCode::OK);
    let sessions = sessions.as_array().expect("session list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0]["id"], a["session_id"]);

    // Running it again finds nothing left to revoke.
    let (_, body) = send(
        &app.router,
        post_json("/api/sessions/revoke-others", Some(token_a), json!({})),
    )
    .await;
    assert_eq!(body["revoked_count"], 0);
}

#[tokio::test]
async fn current_session_cannot_be_revoked_through_the_sessions_api() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let token_a = a["access_token"].as_str().unwrap();
    let uri = format!("/api/sessions/{}", a["session_id"].as_str().unwrap());

    let (status, body) = send(&app.router, delete(&uri, token_a)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    let (status, body) = send(
        &app.router,
        post_json("/api/auth/logout", Some(token_a), json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], true);

    let (status, _) = send(&app.router, get("/api/auth/me", Some(token_a))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn revoking_another_device_is_idempotent() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let b = login(&app.router, "device-b").await;
    let token_a = a["access_token"].as_str().unwrap();
    let uri = format!("/api/sessions/{}", b["session_id"].as_str().unwrap());

    let (status, body) = send(&app.router, delete(&uri, token_a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], true);

    let (status, body) = send(&app.router, delete(&uri, token_a)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["revoked"], false);

    let (_, session_b) = send(&app.router, get(&uri, Some(token_a))).await;
    assert_eq!(session_b["revocation_reason"], "Revoked by user");
}

#[tokio::test]
async fn refresh_requires_the_matching_handle() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let session_id = a["session_id"].clone();

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/auth/refresh",
            None,
            json!({ "session_id": session_id, "refresh_handle": "not-the-handle" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    // Still fresh, so the cached token comes back without a refresh grant.
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/auth/refresh",
            None,
            json!({ "session_id": session_id, "refresh_handle": a["refresh_handle"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["access_token"], "access-1");
}

#[tokio::test]
async fn stale_access_token_is_refreshed_before_it_is_returned() {
    // Lifetime shorter than the refresh margin, so every request refreshes.
    let idp = mock_identity_provider(30).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let (status, body) = send(
        &app.router,
        post_json(
            "/api/auth/refresh",
            None,
            json!({ "session_id": a["session_id"], "refresh_handle": a["refresh_handle"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["access_token"], "access-2");

    // The old access token no longer authenticates.
    let (status, _) = send(
        &app.router,
        get("/api/auth/me", a["access_token"].as_str()),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = send(&app.router, get("/api/auth/me", Some("access-2"))).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn refresh_after_logout_requires_login() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let a = login(&app.router, "device-a").await;
    let token_a = a["access_token"].as_str().unwrap();
    send(
        &app.router,
        post_json("/api/auth/logout", Some(token_a), json!({})),
    )
    .await;

    let (status, body) = send(
        &app.router,
        post_json(
            "/api/auth/refresh",
            None,
            json!({ "session_id": a["session_id"], "refresh_handle": a["refresh_handle"] }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "LOGIN_REQUIRED");
    assert_eq!(body["details"]["login_url"], "/api/auth/login");
}

#[tokio::test]
async fn authorization_state_cannot_be_replayed() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let state = support::begin_login(&app.router).await;
    let callback = json!({ "code": "code-1", "state": state, "device_id": "device-a" });

    let (status, _) = send(
        &app.router,
        post_json("/api/auth/callback", None, callback.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app.router, post_json("/api/auth/callback", None, callback)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn sessions_api_rejects_missing_bearer_token() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let (status, body) = send(&app.router, get("/api/sessions", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn trace_context_is_continued_and_echoed() {
    let idp = mock_identity_provider(900).await;
    let app = test_app(&idp.uri());

    let request = axum::http::Request::builder()
        .uri("/api/auth/login")
        .header(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        )
        .header("x-request-id", "req-42")
        .body(axum::body::Body::empty())
        .unwrap();
    let response = tower::ServiceExt::oneshot(app.router.clone(), request)
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "req-42");
    let traceparent = response.headers()["traceparent"].to_str().unwrap();
    assert!(traceparent.starts_with("00-0af7651916cd43dd8448eb211c80319c-"));
    assert!(!traceparent.contains("b7ad6b7169203331"));
}
