//! Retry policy with configurable backoff and jitter.
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::trace::{current_context, TraceContext};

/// Status classes never retried: bad request, unauthorized, forbidden, not found, conflict.
pub const DEFAULT_EXCLUDED_STATUS_CODES: [u16; 5] = [400, 401, 403, 404, 409];

/// Classification hooks the retry loop needs from an error.
pub trait Retryable {
    /// HTTP-like status attached to the error, if any.
    fn status_code(&self) -> Option<u16>;

    /// Network failure, timeout, or server-side (5xx) failure.
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffMode {
    #[default]
    Exponential,
    Linear,
    Constant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryStrategy {
    pub mode: BackoffMode,
    /// Extra attempts after the first one
    pub max_retries: u32,
    #[serde(with = "duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    #[serde(with = "duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Fraction of the delay used as ± jitter
    pub jitter_factor: f64,
    pub excluded_status_codes: BTreeSet<u16>,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Exponential,
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.3,
            excluded_status_codes: DEFAULT_EXCLUDED_STATUS_CODES.into_iter().collect(),
        }
    }
}

impl RetryStrategy {
    /// A strategy that runs the operation exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn with_mode(mut self, mode: BackoffMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_factor(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.max(0.0);
        self
    }

    pub fn with_excluded_status_codes(mut self, codes: impl IntoIterator<Item = u16>) -> Self {
        self.excluded_status_codes = codes.into_iter().collect();
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Decides whether `error` deserves another attempt under `strategy`.
pub fn should_retry<E>(error: &E, strategy: &RetryStrategy) -> bool
where
    E: Retryable + ?Sized,
{
    if let Some(status) = error.status_code() {
        if strategy.excluded_status_codes.contains(&status) {
            return false;
        }
    }
    error.is_transient()
}

/// Delay before retry number `attempt` (1-based), clamped and jittered.
pub fn calculate_delay(attempt: u32, strategy: &RetryStrategy) -> Duration {
    let attempt = attempt.max(1);
    let base = strategy.base_delay.as_millis() as f64;

    let raw = match strategy.mode {
        BackoffMode::Exponential => base * 2f64.powi((attempt - 1).min(62) as i32),
        BackoffMode::Linear => base * f64::from(attempt),
        BackoffMode::Constant => base,
    };
    let delay = raw.min(strategy.max_delay.as_millis() as f64);

    let jitter = if strategy.jitter_factor > 0.0 {
        signed_unit_sample() * delay * strategy.jitter_factor
    } else {
        0.0
    };

    Duration::from_millis((delay + jitter).max(0.0).round() as u64)
}

/// Uniform sample in [-1, 1). Only used to spread retries apart.
fn signed_unit_sample() -> f64 {
    let mut bytes = [0u8; 8];
    let raw = match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => u64::from_le_bytes(bytes),
        Err(err) => {
            tracing::debug!(error = %err, "OS randomness unavailable, falling back to thread rng");
            rand::thread_rng().next_u64()
        }
    };
    let unit = (raw >> 11) as f64 / (1u64 << 53) as f64;
    unit * 2.0 - 1.0
}

/// Per-attempt metadata handed to the retried operation.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 0 for the first call, 1.. for retries
    pub number: u32,
    /// Child span of the ambient context; the trace id is shared by all attempts
    pub trace: TraceContext,
}

impl RetryAttempt {
    pub fn is_retry(&self) -> bool {
        self.number > 0
    }
}

/// Runs `operation` until it succeeds, fails with a non-retryable error, or
/// `strategy.max_retries` retries have been spent. The last error is returned
/// unchanged.
pub async fn with_retry<F, Fut, T, E>(strategy: &RetryStrategy, mut operation: F) -> Result<T, E>
where
    F: FnMut(RetryAttempt) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + fmt::Display,
{
    let origin = current_context();
    let mut attempt = 0;

    loop {
        let trace = origin.child();
        let trace_id = trace.trace_id;
        match operation(RetryAttempt {
            number: attempt,
            trace,
        })
        .await
        {
            Ok(result) => return Ok(result),
            Err(error) => {
                if !should_retry(&error, strategy) {
                    return Err(error);
                }
                if attempt >= strategy.max_retries {
                    warn!(
                        max_retries = strategy.max_retries,
                        trace_id = %trace_id,
                        error = %error,
                        "Max retries reached"
                    );
                    return Err(error);
                }

                attempt += 1;
                let delay = calculate_delay(attempt, strategy);
                warn!(
                    attempt,
                    max_retries = strategy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    trace_id = %trace_id,
                    error = %error,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
