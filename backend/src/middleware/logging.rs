use axum::{
    body::{to_bytes, Body, Bytes},
    http::{header::CONTENT_LENGTH, Request, StatusCode},
    middleware::Next,
    response::Response,
};
use lessonhub_resilience::{current_context, headers::SKIP_LOGGING_HEADER};
use std::time::Instant;

const MAX_BUFFERED_BODY_BYTES: usize = 64 * 1024;
const MAX_LOGGED_BODY_BYTES: usize = 2048;

struct ErrorResponseEvent<'a> {
    status: StatusCode,
    method: &'a str,
    path: &'a str,
    latency_ms: u64,
    trace_id: String,
}

/// Logs every 4xx/5xx response with a preview of its body. The body is
/// buffered and forwarded unchanged. Requests carrying `x-skip-logging`
/// (health probes, session checks) pass through untouched.
pub async fn log_error_responses(req: Request<Body>, next: Next) -> Response {
    if req.headers().contains_key(SKIP_LOGGING_HEADER) {
        return next.run(req).await;
    }

    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let trace_id = current_context().trace_id.to_string();
    let start = Instant::now();

    let response = next.run(req).await;
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return response;
    }

    let event = ErrorResponseEvent {
        status,
        method: &method,
        path: &path,
        latency_ms: start.elapsed().as_millis() as u64,
        trace_id,
    };
    let (mut parts, body) = response.into_parts();
    match to_bytes(body, MAX_BUFFERED_BODY_BYTES).await {
        Ok(bytes) => {
            event.log(&preview(&bytes));
            Response::from_parts(parts, Body::from(bytes))
        }
        Err(err) => {
            parts.headers.remove(CONTENT_LENGTH);
            event.log(&format!("<unreadable body: {err}>"));
            Response::from_parts(parts, Body::empty())
        }
    }
}

fn preview(bytes: &Bytes) -> String {
    if bytes.len() > MAX_LOGGED_BODY_BYTES {
        format!(
            "{}... (truncated, {} bytes total)",
            String::from_utf8_lossy(&bytes[..MAX_LOGGED_BODY_BYTES]),
            bytes.len()
        )
    } else {
        String::from_utf8_lossy(bytes).to_string()
    }
}

impl ErrorResponseEvent<'_> {
    fn log(&self, body: &str) {
        let status = self.status.as_u16();
        if self.status.is_server_error() {
            tracing::error!(
                status,
                method = self.method,
                path = self.path,
                latency_ms = self.latency_ms,
                trace_id = %self.trace_id,
                body,
                "Request completed with error status"
            );
        } else {
            tracing::warn!(
                status,
                method = self.method,
                path = self.path,
                latency_ms = self.latency_ms,
                trace_id = %self.trace_id,
                body,
                "Request completed with error status"
            );
        }
    }
}
