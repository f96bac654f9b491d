//! Resilience primitives shared by the LessonHub API and its browser client
//!
//! This library provides:
//! - **Retry**: error classification, backoff delay with jitter, and a bounded retry loop
//! - **Trace context**: W3C `traceparent` propagation with a child span per attempt
//! - **Headers**: the outbound header names both sides agree on
//!
//! # Example: retrying an outbound call
//!
//! ```rust,no_run
//! use lessonhub_resilience::{with_retry, RetryStrategy, Retryable};
//!
//! #[derive(Debug)]
//! struct Unavailable;
//!
//! impl std::fmt::Display for Unavailable {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "service unavailable")
//!     }
//! }
//!
//! impl Retryable for Unavailable {
//!     fn status_code(&self) -> Option<u16> {
//!         Some(503)
//!     }
//!
//!     fn is_transient(&self) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let strategy = RetryStrategy::default();
//!     let result = with_retry(&strategy, |attempt| async move {
//!         let _header = attempt.trace.traceparent();
//!         Err::<(), _>(Unavailable)
//!     })
//!     .await;
//!     assert!(result.is_err());
//! }
//! ```
pub mod headers;
pub mod retry;
pub mod trace;

pub use retry::{
    calculate_delay, should_retry, with_retry, BackoffMode, RetryAttempt, RetryStrategy, Retryable,
    DEFAULT_EXCLUDED_STATUS_CODES,
};
pub use trace::{current_context, scope, SpanId, TraceContext, TraceId, TraceParseError};
