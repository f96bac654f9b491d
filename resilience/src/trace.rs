//! W3C trace-context propagation.
//!
//! A [`TraceContext`] identifies one logical operation (the trace) and one
//! attempt inside it (the span). Retries derive a child span so every attempt
//! keeps the trace id of the call that started it.

use rand::RngCore;
use std::fmt;
use std::future::Future;

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

const SUPPORTED_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

tokio::task_local! {
    static CURRENT: TraceContext;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceParseError {
    #[error("traceparent must have 4 dash-separated fields")]
    FieldCount,
    #[error("unsupported traceparent version: {0}")]
    UnsupportedVersion(String),
    #[error("invalid {field}: expected {expected} lowercase hex characters")]
    InvalidHex {
        field: &'static str,
        expected: usize,
    },
    #[error("{0} must not be all zeros")]
    AllZero(&'static str),
}

fn decode_id<const N: usize>(value: &str, field: &'static str) -> Result<[u8; N], TraceParseError> {
    let well_formed = value.len() == N * 2
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !well_formed {
        return Err(TraceParseError::InvalidHex {
            field,
            expected: N * 2,
        });
    }

    let mut bytes = [0u8; N];
    hex::decode_to_slice(value, &mut bytes).map_err(|_| TraceParseError::InvalidHex {
        field,
        expected: N * 2,
    })?;
    if bytes.iter().all(|b| *b == 0) {
        return Err(TraceParseError::AllZero(field));
    }
    Ok(bytes)
}

fn random_non_zero<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    let mut rng = rand::thread_rng();
    loop {
        rng.fill_bytes(&mut bytes);
        if bytes.iter().any(|b| *b != 0) {
            return bytes;
        }
    }
}

/// 16-byte identifier shared by every span of one trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    pub fn random() -> Self {
        Self(random_non_zero())
    }

    pub fn from_hex(value: &str) -> Result<Self, TraceParseError> {
        decode_id(value, "trace-id").map(Self)
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 8-byte identifier of a single span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId([u8; 8]);

impl SpanId {
    pub fn random() -> Self {
        Self(random_non_zero())
    }

    pub fn from_hex(value: &str) -> Result<Self, TraceParseError> {
        decode_id(value, "parent-id").map(Self)
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub sampled: bool,
    pub trace_state: Option<String>,
}

impl TraceContext {
    /// Starts a new trace with no parent.
    pub fn new_root() -> Self {
        Self {
            trace_id: TraceId::random(),
            span_id: SpanId::random(),
            parent_span_id: None,
            sampled: true,
            trace_state: None,
        }
    }

    /// Derives a span nested under this one. The trace id is kept.
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(),
            parent_span_id: Some(self.span_id),
            sampled: self.sampled,
            trace_state: self.trace_state.clone(),
        }
    }

    /// Renders the `traceparent` header value.
    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{}-{}-{}-{:02x}",
            SUPPORTED_VERSION, self.trace_id, self.span_id, flags
        )
    }

    /// Parses an incoming `traceparent` (and optional `tracestate`).
    ///
    /// The returned context carries the caller's span id; callers that do
    /// work on behalf of the request should continue with [`Self::child`].
    pub fn from_headers(
        traceparent: &str,
        trace_state: Option<&str>,
    ) -> Result<Self, TraceParseError> {
        let parts: Vec<&str> = traceparent.trim().split('-').collect();
        let [version, trace_id, span_id, flags] = parts.as_slice() else {
            return Err(TraceParseError::FieldCount);
        };
        if *version != SUPPORTED_VERSION {
            return Err(TraceParseError::UnsupportedVersion(version.to_string()));
        }

        let trace_id = TraceId::from_hex(trace_id)?;
        let span_id = SpanId::from_hex(span_id)?;
        let flags = if flags.len() == 2 {
            u8::from_str_radix(flags, 16).map_err(|_| TraceParseError::InvalidHex {
                field: "trace-flags",
                expected: 2,
            })?
        } else {
            return Err(TraceParseError::InvalidHex {
                field: "trace-flags",
                expected: 2,
            });
        };

        Ok(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            sampled: flags & FLAG_SAMPLED == FLAG_SAMPLED,
            trace_state: trace_state
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
        })
    }

    /// Like [`Self::from_headers`], but starts a new root on missing or malformed input.
    pub fn from_headers_or_root(traceparent: Option<&str>, trace_state: Option<&str>) -> Self {
        match traceparent.map(|value| Self::from_headers(value, trace_state)) {
            Some(Ok(context)) => context,
            Some(Err(err)) => {
                tracing::debug!(error = %err, "Ignoring malformed traceparent");
                Self::new_root()
            }
            None => Self::new_root(),
        }
    }
}

/// Returns the ambient context of the current unit of work, or a fresh root
/// when the caller is not running inside [`scope`].
pub fn current_context() -> TraceContext {
    CURRENT
        .try_with(TraceContext::clone)
        .unwrap_or_else(|_| TraceContext::new_root())
}

/// Runs `future` with `context` as its ambient trace context.
pub async fn scope<F>(context: TraceContext, future: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(context, future).await
}
