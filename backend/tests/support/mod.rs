#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use lessonhub_backend::{
    config::{Config, SessionStoreKind},
    repositories::InMemorySessionRepository,
    router::build_router,
    services::{
        pkce::InMemoryVerifierStore, HttpIdentityProvider, IdpSettings, SessionService,
        TokenIssuanceService,
    },
    state::AppState,
};
use lessonhub_resilience::RetryStrategy;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, Request as MockRequest, ResponseTemplate,
};

pub const SUBJECT: &str = "4f1c2d8e-9b7a-4c3d-8e2f-1a2b3c4d5e6f";

pub fn test_config(issuer_url: &str) -> Config {
    Config {
        session_store: SessionStoreKind::Memory,
        identity_provider: IdpSettings {
            issuer_url: issuer_url.to_string(),
            ..IdpSettings::default()
        },
        idp_timeout: Duration::from_secs(5),
        idp_retry: RetryStrategy::no_retry(),
        ..Config::default()
    }
}

/// Identity provider that issues `access-N` / `refresh-N` on every token call.
pub async fn mock_identity_provider(access_expires_in: i64) -> MockServer {
    let server = MockServer::start().await;
    let issued = Arc::new(AtomicUsize::new(0));

    Mock::given(method("POST"))
        .and(path("/connect/token"))
        .respond_with(move |_: &MockRequest| {
            let n = issued.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200).set_body_json(json!({
                "access_token": format!("access-{n}"),
                "refresh_token": format!("refresh-{n}"),
                "expires_in": access_expires_in,
                "refresh_expires_in": 86_400,
                "token_type": "Bearer"
            }))
        })
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/connect/userinfo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sub": SUBJECT,
            "email": "learner@example.com",
            "name": "Test Learner",
            "roles": ["learner"]
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/connect/revocation"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    server
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
}

pub fn test_app(issuer_url: &str) -> TestApp {
    let config = test_config(issuer_url);
    let sessions = SessionService::new(Arc::new(InMemorySessionRepository::new()));
    let identity_provider = HttpIdentityProvider::new(
        config.identity_provider.clone(),
        config.idp_timeout,
        config.idp_retry.clone(),
    )
    .expect("build identity provider client");
    let issuance = TokenIssuanceService::new(
        Arc::new(identity_provider),
        sessions.clone(),
        Arc::new(InMemoryVerifierStore::new(config.pkce_verifier_ttl)),
        config.token_refresh_margin,
        config.login_path.clone(),
    );
    let state = AppState::new(config, sessions, issuance);
    TestApp {
        router: build_router(state.clone()),
        state,
    }
}

pub async fn send(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(request)
        .await
        .expect("call router");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

pub fn get(uri: &str, access_token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = access_token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder.body(Body::empty()).expect("build request")
}

pub fn post_json(uri: &str, access_token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = access_token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("build request")
}

pub fn delete(uri: &str, access_token: &str) -> Request<Body> {
    Request::builder()
        .method("DELETE")
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {access_token}"))
        .body(Body::empty())
        .expect("build request")
}

pub async fn begin_login(router: &Router) -> String {
    let (status, body) = send(router, get("/api/auth/login", None)).await;
    assert_eq!(status, StatusCode::OK);
    body["state"].as_str().expect("state").to_string()
}

/// Runs the full login flow and returns the login response body.
pub async fn login(router: &Router, device_id: &str) -> Value {
    let state = begin_login(router).await;
    let (status, body) = send(
        router,
        post_json(
            "/api/auth/callback",
            None,
            json!({
                "code": format!("code-{device_id}"),
                "state": state,
                "device_id": device_id,
                "device_name": format!("{device_id} browser")
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {body}");
    body
}
