use anyhow::anyhow;
use lessonhub_resilience::RetryStrategy;
use serde::{Deserialize, Serialize};
use std::{env, str::FromStr, time::Duration};

const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";

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

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the API, including the `/api` prefix.
    pub api_base_url: String,
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Bound on the initial session probe; a timeout counts as signed out.
    #[serde(with = "duration_ms", rename = "session_check_timeout_ms")]
    pub session_check_timeout: Duration,
    pub retry: RetryStrategy,
    #[serde(with = "duration_ms", rename = "redirect_cooldown_ms")]
    pub redirect_cooldown: Duration,
    pub login_path: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            session_check_timeout: Duration::from_secs(15),
            retry: RetryStrategy::default(),
            redirect_cooldown: Duration::from_secs(5),
            login_path: "/login".to_string(),
        }
    }
}

fn env_parse<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| anyhow!("Invalid {} value '{}': {}", key, raw, e)),
        _ => Ok(default),
    }
}

impl ClientConfig {
    pub fn new(api_base_url: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into().trim_end_matches('/').to_string(),
            ..Self::default()
        }
    }

    /// Reads `LESSONHUB_*` overrides on top of the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let api_base_url = env::var("LESSONHUB_API_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or(defaults.api_base_url);

        let retry = defaults
            .retry
            .clone()
            .with_max_retries(env_parse(
                "LESSONHUB_RETRY_MAX_RETRIES",
                defaults.retry.max_retries,
            )?)
            .with_base_delay(Duration::from_millis(env_parse(
                "LESSONHUB_RETRY_BASE_DELAY_MS",
                defaults.retry.base_delay.as_millis() as u64,
            )?));

        Ok(Self {
            api_base_url: api_base_url.trim_end_matches('/').to_string(),
            request_timeout: Duration::from_secs(env_parse(
                "LESSONHUB_REQUEST_TIMEOUT_SECS",
                defaults.request_timeout.as_secs(),
            )?),
            session_check_timeout: Duration::from_secs(env_parse(
                "LESSONHUB_SESSION_CHECK_TIMEOUT_SECS",
                defaults.session_check_timeout.as_secs(),
            )?),
            retry,
            redirect_cooldown: Duration::from_millis(env_parse(
                "LESSONHUB_REDIRECT_COOLDOWN_MS",
                defaults.redirect_cooldown.as_millis() as u64,
            )?),
            login_path: env::var("LESSONHUB_LOGIN_PATH").unwrap_or(defaults.login_path),
        })
    }

    pub fn with_retry(mut self, retry: RetryStrategy) -> Self {
        self.retry = retry;
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.api_base_url, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = ClientConfig::default();
        assert_eq!(config.api_base_url, "http://localhost:3000/api");
        assert_eq!(config.session_check_timeout, Duration::from_secs(15));
        assert_eq!(config.redirect_cooldown, Duration::from_secs(5));
        assert_eq!(config.login_path, "/login");
    }

    #[test]
    fn deserializes_partial_overrides() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"api_base_url":"https://api.example.com/api","redirect_cooldown_ms":250,"retry":{"max_retries":1}}"#,
        )
        .unwrap();
        assert_eq!(config.api_base_url, "https://api.example.com/api");
        assert_eq!(config.redirect_cooldown, Duration::from_millis(250));
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.session_check_timeout, Duration::from_secs(15));
    }

    #[test]
    fn endpoint_joins_paths_without_double_slash() {
        let config = ClientConfig::new("http://localhost:3000/api/");
        assert_eq!(config.endpoint("/auth/me"), "http://localhost:3000/api/auth/me");
    }
}
