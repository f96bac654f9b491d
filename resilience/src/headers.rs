//! Header names added to outbound calls.

pub use crate::trace::{TRACEPARENT_HEADER, TRACESTATE_HEADER};

/// Stable identifier of the browser/device issuing the request.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// 1-based retry counter, present only on retried attempts.
pub const RETRY_ATTEMPT_HEADER: &str = "x-retry-attempt";

/// Marks a call that must not be retried.
pub const SKIP_RETRY_HEADER: &str = "x-skip-retry";

/// Marks a call whose failures must not be logged.
pub const SKIP_LOGGING_HEADER: &str = "x-skip-logging";

/// Correlation id echoed by the API.
pub const REQUEST_ID_HEADER: &str = "x-request-id";
