use axum::{
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use lessonhub_resilience::{
    headers::{REQUEST_ID_HEADER, TRACEPARENT_HEADER, TRACESTATE_HEADER},
    scope, TraceContext,
};
use tracing::Instrument;
use uuid::Uuid;

const CORRELATION_ID_HEADER: &str = "x-correlation-id";

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

fn header_str<'a>(req: &'a Request, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Continues the caller's trace (or starts one), exposes it as the ambient
/// context for the handler and everything it calls, and echoes
/// `traceparent` and `x-request-id` on the response.
pub async fn trace_context(mut req: Request, next: Next) -> Response {
    let id = header_str(&req, REQUEST_ID_HEADER)
        .or_else(|| header_str(&req, CORRELATION_ID_HEADER))
        .map(|v| v.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let incoming = TraceContext::from_headers_or_root(
        header_str(&req, TRACEPARENT_HEADER),
        header_str(&req, TRACESTATE_HEADER),
    );
    let context = incoming.child();

    req.extensions_mut().insert(RequestId(id.clone()));
    req.extensions_mut().insert(context.clone());

    let span = tracing::info_span!(
        "request",
        request_id = %id,
        trace_id = %context.trace_id,
        span_id = %context.span_id,
    );
    let traceparent = context.traceparent();
    let mut response = scope(context, next.run(req)).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&traceparent) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACEPARENT_HEADER), value);
    }

    response
}
