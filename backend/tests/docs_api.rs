use axum::http::StatusCode;
use serde_json::Value;
use lessonhub_backend::docs;
use utoipa::OpenApi;

mod support;

#[test]
fn openapi_includes_auth_paths_and_bearer_scheme() {
    let openapi = docs::ApiDoc::openapi();
    let json = serde_json::to_value(&openapi).expect("serialize openapi");

    let paths = json
        .get("paths")
        .and_then(|v| v.as_object())
        .expect("paths object");
    assert!(paths.contains_key("/api/auth/login"));
    assert!(paths.contains_key("/api/auth/callback"));
    assert!(paths.contains_key("/api/sessions/{id}/activity"));

    let bearer = json
        .pointer("/components/securitySchemes/BearerAuth")
        .expect("BearerAuth scheme");
    assert_eq!(bearer.get("type").and_then(Value::as_str), Some("http"));
    assert_eq!(
        bearer.get("scheme").and_then(Value::as_str),
        Some("bearer")
    );
}

#[tokio::test]
async fn openapi_json_is_served_without_auth() {
    let app = support::test_app("http://127.0.0.1:9");
    let (status, body) = support::send(
        &app.router,
        support::get("/api/docs/openapi.json", None),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(body.pointer("/paths/~1api~1sessions").is_some());
    assert!(body.pointer("/components/schemas/SessionResponse").is_some());
}
