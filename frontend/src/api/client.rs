use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lessonhub_resilience::headers::{
    DEVICE_ID_HEADER, RETRY_ATTEMPT_HEADER, SKIP_LOGGING_HEADER, SKIP_RETRY_HEADER,
    TRACEPARENT_HEADER, TRACESTATE_HEADER,
};
use lessonhub_resilience::{with_retry, RetryStrategy};
use reqwest::{Client, Method, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::{
    api::types::{AccessTokenResponse, ApiError, RefreshRequest},
    auth::{
        coordinator::{RefreshCoordinator, TokenRefresher},
        device,
        redirect::{LoginRedirector, Navigator},
    },
    config::ClientConfig,
    utils::storage::Storage,
};

/// One outbound API call, before headers are attached.
#[derive(Debug, Clone)]
pub(crate) struct Call<'a> {
    pub method: Method,
    pub path: &'a str,
    pub body: Option<&'a Value>,
    pub bearer: Option<&'a str>,
    pub skip_retry: bool,
    pub skip_logging: bool,
    pub timeout: Option<Duration>,
}

impl<'a> Call<'a> {
    pub fn new(method: Method, path: &'a str) -> Self {
        Self {
            method,
            path,
            body: None,
            bearer: None,
            skip_retry: false,
            skip_logging: false,
            timeout: None,
        }
    }

    pub fn body(mut self, body: Option<&'a Value>) -> Self {
        self.body = body;
        self
    }

    pub fn bearer(mut self, token: Option<&'a str>) -> Self {
        self.bearer = token;
        self
    }

    pub fn probe(mut self, timeout: Duration) -> Self {
        self.skip_retry = true;
        self.skip_logging = true;
        self.timeout = Some(timeout);
        self
    }
}

fn transport_error(err: reqwest::Error) -> ApiError {
    if err.is_timeout() {
        ApiError::timeout(format!("Request timed out: {}", err))
    } else {
        ApiError::request_failed(format!("Request failed: {}", err))
    }
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    response
        .json()
        .await
        .map_err(|e| ApiError::unknown(format!("Failed to parse response: {}", e)))
}

/// Sends calls with retry, trace and device headers. Knows nothing about
/// token refresh.
#[derive(Clone)]
pub(crate) struct Transport {
    http: Client,
    config: Arc<ClientConfig>,
    storage: Arc<dyn Storage>,
}

impl Transport {
    pub async fn send(&self, call: &Call<'_>) -> Result<Response, ApiError> {
        let no_retry;
        let strategy = if call.skip_retry {
            no_retry = RetryStrategy::no_retry();
            &no_retry
        } else {
            &self.config.retry
        };
        let url = self.config.endpoint(call.path);
        // Never minted here: anonymous calls go out without a device id.
        let device_id = device::device_id(self.storage.as_ref());

        with_retry(strategy, |attempt| {
            let mut request = self
                .http
                .request(call.method.clone(), &url)
                .header(TRACEPARENT_HEADER, attempt.trace.traceparent());
            if let Some(state) = &attempt.trace.trace_state {
                request = request.header(TRACESTATE_HEADER, state.as_str());
            }
            if attempt.is_retry() {
                request = request.header(RETRY_ATTEMPT_HEADER, attempt.number.to_string());
            }
            if let Some(id) = &device_id {
                request = request.header(DEVICE_ID_HEADER, id.as_str());
            }
            if let Some(token) = call.bearer {
                request = request.bearer_auth(token);
            }
            if call.skip_retry {
                request = request.header(SKIP_RETRY_HEADER, "1");
            }
            if call.skip_logging {
                request = request.header(SKIP_LOGGING_HEADER, "1");
            }
            if let Some(timeout) = call.timeout {
                request = request.timeout(timeout);
            }
            if let Some(body) = call.body {
                request = request.json(body);
            }

            async move {
                let response = request.send().await.map_err(transport_error)?;
                let status = response.status();
                if status.is_success() {
                    Ok(response)
                } else {
                    let body = response.text().await.unwrap_or_default();
                    Err(ApiError::from_response_body(status.as_u16(), &body))
                }
            }
        })
        .await
    }
}

/// Calls the refresh endpoint directly. Used only by the coordinator.
struct RefreshEndpoint {
    transport: Transport,
}

#[async_trait]
impl TokenRefresher for RefreshEndpoint {
    async fn refresh(&self, request: RefreshRequest) -> Result<AccessTokenResponse, ApiError> {
        let body = serde_json::to_value(&request)
            .map_err(|e| ApiError::unknown(format!("Failed to encode request: {}", e)))?;
        let response = self
            .transport
            .send(&Call::new(Method::POST, "/auth/refresh").body(Some(&body)))
            .await?;
        decode(response).await
    }
}

#[derive(Clone)]
pub struct ApiClient {
    pub(crate) transport: Transport,
    pub(crate) coordinator: RefreshCoordinator,
    pub(crate) storage: Arc<dyn Storage>,
    pub(crate) config: Arc<ClientConfig>,
}

impl ApiClient {
    pub fn new(
        config: ClientConfig,
        storage: Arc<dyn Storage>,
        navigator: Arc<dyn Navigator>,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ApiError::unknown(format!("Failed to build HTTP client: {}", e)))?;
        let config = Arc::new(config);
        let transport = Transport {
            http,
            config: config.clone(),
            storage: storage.clone(),
        };
        let redirector = Arc::new(LoginRedirector::new(
            navigator,
            config.login_path.clone(),
            config.redirect_cooldown,
        ));
        let coordinator = RefreshCoordinator::new(
            Arc::new(RefreshEndpoint {
                transport: transport.clone(),
            }),
            storage.clone(),
            redirector,
        );

        Ok(Self {
            transport,
            coordinator,
            storage,
            config,
        })
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    /// Sends an authenticated call. A 401 triggers one refresh (or joins the
    /// running one) and a single retry with the new token; a second 401
    /// signs the user out.
    pub(crate) async fn send_authorized(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Response, ApiError> {
        if let Some(in_flight) = self.coordinator.wait_for_refresh() {
            let _ = in_flight.await;
        }

        let token = self.coordinator.access_token();
        let call = Call::new(method, path)
            .body(body)
            .bearer(token.as_deref());
        match self.transport.send(&call).await {
            Err(err) if err.is_unauthorized() => {
                log::debug!("{} returned 401; refreshing access token", path);
                let fresh = match self.coordinator.access_token() {
                    // Another caller already refreshed.
                    Some(current) if token.as_ref() != Some(&current) => current,
                    _ => self.coordinator.refresh_token().await?,
                };
                let retry = call.bearer(Some(&fresh));
                match self.transport.send(&retry).await {
                    Err(err) if err.is_unauthorized() => {
                        log::warn!("{} still unauthorized after refresh", path);
                        self.coordinator.force_logout();
                        Err(err)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Sends a call to an auth endpoint. These never trigger a refresh; a
    /// 401 signs the user out.
    pub(crate) async fn send_public(&self, call: Call<'_>) -> Result<Response, ApiError> {
        let result = self.transport.send(&call).await;
        if matches!(&result, Err(err) if err.is_unauthorized()) {
            self.coordinator.force_logout();
        }
        result
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        decode(self.send_authorized(Method::GET, path, None).await?).await
    }

    pub(crate) async fn post_json<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, ApiError> {
        decode(self.send_authorized(Method::POST, path, Some(body)).await?).await
    }
}
