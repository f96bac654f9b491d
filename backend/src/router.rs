use axum::{
    http::{HeaderName, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use lessonhub_resilience::headers::{REQUEST_ID_HEADER, TRACEPARENT_HEADER};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{docs, handlers, middleware, state::AppState};

pub fn build_router(state: AppState) -> Router {
    // Public routes (no auth)
    let public_routes = Router::new()
        .route("/api/auth/login", get(handlers::auth::begin_login))
        .route("/api/auth/callback", post(handlers::auth::callback))
        .route("/api/auth/refresh", post(handlers::auth::refresh))
        .route("/api/docs/openapi.json", get(docs::openapi_json));

    // User routes (auth required)
    let user_routes = Router::new()
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/sessions",
            get(handlers::sessions::list_sessions).post(handlers::sessions::create_session),
        )
        .route(
            "/api/sessions/devices",
            get(handlers::sessions::list_devices),
        )
        .route(
            "/api/sessions/revoke-others",
            post(handlers::sessions::revoke_other_sessions),
        )
        .route(
            "/api/sessions/{id}",
            get(handlers::sessions::get_session).delete(handlers::sessions::revoke_session),
        )
        .route(
            "/api/sessions/{id}/activity",
            post(handlers::sessions::update_activity),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::auth,
        ));

    let cors = cors_layer(&state.config.cors_allow_origins);

    Router::new()
        .merge(public_routes)
        .merge(user_routes)
        .layer(axum_middleware::from_fn(middleware::log_error_responses))
        .layer(axum_middleware::from_fn(middleware::trace_context))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
        .with_state(state)
}

fn cors_layer(allowed: &[String]) -> CorsLayer {
    let origin = if allowed.iter().any(|origin| origin == "*") {
        AllowOrigin::from(Any)
    } else {
        let origins: Vec<HeaderValue> = allowed
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(_) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(REQUEST_ID_HEADER),
            HeaderName::from_static(TRACEPARENT_HEADER),
        ])
        .max_age(Duration::from_secs(24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_layer_accepts_wildcard_and_lists() {
        let _ = cors_layer(&["*".to_string()]);
        let _ = cors_layer(&[
            "http://localhost:8080".to_string(),
            "not a header\n".to_string(),
        ]);
    }
}
