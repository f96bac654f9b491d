use axum::http::{header::USER_AGENT, HeaderMap};
use lessonhub_resilience::headers::DEVICE_ID_HEADER;

fn header_value(headers: &HeaderMap, name: impl axum::http::header::AsHeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Client address as reported by the reverse proxy.
pub fn extract_ip(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        return value
            .split(',')
            .next()
            .map(|ip| ip.trim().to_string())
            .filter(|ip| !ip.is_empty());
    }
    header_value(headers, "x-real-ip")
}

pub fn extract_user_agent(headers: &HeaderMap) -> Option<String> {
    header_value(headers, USER_AGENT)
}

pub fn extract_device_id(headers: &HeaderMap) -> Option<String> {
    header_value(headers, DEVICE_ID_HEADER)
}
