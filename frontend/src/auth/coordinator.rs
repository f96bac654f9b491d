//! Single-flight access token refresh.
//!
//! Every caller that needs a new token while a refresh is running joins that
//! refresh instead of starting another. The in-flight refresh is a spawned
//! task exposed as a [`Shared`] future, so it completes even if every waiter
//! goes away and late subscribers still observe its outcome.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use lessonhub_resilience::{current_context, scope};

use crate::api::types::{AccessTokenResponse, ApiError, RefreshRequest};
use crate::auth::redirect::LoginRedirector;
use crate::utils::storage::{
    clear_auth_session, Storage, ACCESS_TOKEN_EXPIRES_AT_KEY, ACCESS_TOKEN_KEY,
    REFRESH_HANDLE_KEY, SESSION_ID_KEY,
};

const ANONYMOUS_KEY: &str = "anonymous";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RefreshError {
    #[error("no session credentials to refresh")]
    MissingCredentials,
    #[error("login required")]
    LoginRequired { login_url: String },
    #[error("token refresh failed: {0}")]
    Failed(ApiError),
    #[error("token refresh task ended unexpectedly")]
    Aborted,
}

impl From<RefreshError> for ApiError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::LoginRequired { login_url } => ApiError::login_required(login_url),
            RefreshError::Failed(err) => err,
            RefreshError::MissingCredentials => ApiError {
                status: Some(401),
                ..ApiError::unknown("Not signed in")
            },
            RefreshError::Aborted => ApiError::unknown("Token refresh task ended unexpectedly"),
        }
    }
}

pub type RefreshResult = Result<String, RefreshError>;
pub type SharedRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// Performs the refresh exchange. Implementations must not go through the
/// coordinator themselves.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, request: RefreshRequest) -> Result<AccessTokenResponse, ApiError>;
}

struct InFlight {
    id: u64,
    refresh: SharedRefresh,
}

struct Inner {
    refresher: Arc<dyn TokenRefresher>,
    storage: Arc<dyn Storage>,
    redirector: Arc<LoginRedirector>,
    in_flight: Mutex<HashMap<String, InFlight>>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        storage: Arc<dyn Storage>,
        redirector: Arc<LoginRedirector>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                refresher,
                storage,
                redirector,
                in_flight: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Cached access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.inner.storage.get_item(ACCESS_TOKEN_KEY)
    }

    /// Installs the refresh for the current session, or returns the one
    /// already running. The install happens before this returns.
    pub fn begin_refresh(&self) -> SharedRefresh {
        let key = self.inner.session_key();
        let mut in_flight = self.inner.lock_in_flight();
        if let Some(existing) = in_flight.get(&key) {
            return existing.refresh.clone();
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let task_key = key.clone();
        let task = tokio::spawn(scope(current_context(), async move {
            let result = inner.run_refresh().await;
            inner.finish(&task_key, id);
            result
        }));
        let refresh = async move { task.await.unwrap_or(Err(RefreshError::Aborted)) }
            .boxed()
            .shared();

        in_flight.insert(
            key,
            InFlight {
                id,
                refresh: refresh.clone(),
            },
        );
        refresh
    }

    /// Refreshes (or joins the running refresh) and returns the new token.
    pub async fn refresh_token(&self) -> RefreshResult {
        self.begin_refresh().await
    }

    /// Handle on the running refresh; `None` when nothing is in flight.
    pub fn wait_for_refresh(&self) -> Option<SharedRefresh> {
        let key = self.inner.session_key();
        self.inner
            .lock_in_flight()
            .get(&key)
            .map(|in_flight| in_flight.refresh.clone())
    }

    pub fn is_refreshing(&self) -> bool {
        self.wait_for_refresh().is_some()
    }

    /// Clears local credentials and sends the user to the login page.
    pub fn force_logout(&self) {
        self.inner.force_logout();
    }
}

impl Inner {
    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, InFlight>> {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn session_key(&self) -> String {
        self.storage
            .get_item(SESSION_ID_KEY)
            .unwrap_or_else(|| ANONYMOUS_KEY.to_string())
    }

    fn finish(&self, key: &str, id: u64) {
        let mut in_flight = self.lock_in_flight();
        if in_flight.get(key).is_some_and(|entry| entry.id == id) {
            in_flight.remove(key);
        }
    }

    fn force_logout(&self) {
        clear_auth_session(self.storage.as_ref());
        self.redirector.redirect_to_login();
    }

    async fn run_refresh(&self) -> RefreshResult {
        let session_id = self.storage.get_item(SESSION_ID_KEY);
        let refresh_handle = self.storage.get_item(REFRESH_HANDLE_KEY);
        let (Some(session_id), Some(refresh_handle)) = (session_id, refresh_handle) else {
            log::info!("No refresh credentials; login required");
            self.force_logout();
            return Err(RefreshError::MissingCredentials);
        };

        log::debug!("Refreshing access token for session {}", session_id);
        match self
            .refresher
            .refresh(RefreshRequest {
                session_id,
                refresh_handle,
            })
            .await
        {
            Ok(token) => {
                self.storage.set_item(ACCESS_TOKEN_KEY, &token.access_token);
                self.storage
                    .set_item(ACCESS_TOKEN_EXPIRES_AT_KEY, &token.expires_at.to_rfc3339());
                Ok(token.access_token)
            }
            Err(err) => {
                log::warn!("Token refresh failed: {}", err);
                self.force_logout();
                if err.is_unauthorized() {
                    let login_url = err
                        .details
                        .as_ref()
                        .and_then(|details| details.get("login_url"))
                        .and_then(|url| url.as_str())
                        .map(str::to_string)
                        .unwrap_or_else(|| self.redirector.login_path().to_string());
                    Err(RefreshError::LoginRequired { login_url })
                } else {
                    Err(RefreshError::Failed(err))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::redirect::HeadlessNavigator;
    use crate::utils::storage::{MemoryStorage, DEVICE_ID_KEY};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    struct GatedRefresher {
        calls: AtomicUsize,
        gate: Semaphore,
        outcome: Result<String, ApiError>,
    }

    impl GatedRefresher {
        fn new(outcome: Result<String, ApiError>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                gate: Semaphore::new(0),
                outcome,
            })
        }

        fn release(&self) {
            self.gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for GatedRefresher {
        async fn refresh(
            &self,
            request: RefreshRequest,
        ) -> Result<AccessTokenResponse, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(request.refresh_handle, "handle-1");
            let _permit = self.gate.acquire().await.expect("gate open");
            self.outcome.clone().map(|access_token| AccessTokenResponse {
                access_token,
                token_type: "Bearer".to_string(),
                expires_at: Utc::now() + ChronoDuration::minutes(15),
            })
        }
    }

    struct Fixture {
        coordinator: RefreshCoordinator,
        storage: Arc<MemoryStorage>,
        navigator: Arc<HeadlessNavigator>,
    }

    fn fixture(refresher: Arc<GatedRefresher>) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        storage.set_item(SESSION_ID_KEY, "session-1");
        storage.set_item(REFRESH_HANDLE_KEY, "handle-1");
        storage.set_item(ACCESS_TOKEN_KEY, "stale");
        storage.set_item(DEVICE_ID_KEY, "device-1");
        let navigator = Arc::new(HeadlessNavigator::at("/lessons"));
        let redirector = Arc::new(LoginRedirector::new(
            navigator.clone(),
            "/login",
            Duration::from_secs(5),
        ));
        Fixture {
            coordinator: RefreshCoordinator::new(refresher, storage.clone(), redirector),
            storage,
            navigator,
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let refresher = GatedRefresher::new(Ok("fresh".to_string()));
        let f = fixture(refresher.clone());

        let first = f.coordinator.begin_refresh();
        let second = f.coordinator.begin_refresh();
        assert!(first.ptr_eq(&second));
        assert!(f.coordinator.is_refreshing());

        let waiters: Vec<_> = (0..8).map(|_| f.coordinator.refresh_token()).collect();
        refresher.release();
        let results = futures::future::join_all(waiters).await;

        for result in results {
            assert_eq!(result, Ok("fresh".to_string()));
        }
        assert_eq!(first.await, Ok("fresh".to_string()));
        assert_eq!(refresher.calls(), 1);
        assert_eq!(f.coordinator.access_token().as_deref(), Some("fresh"));
        assert!(f.storage.get_item(ACCESS_TOKEN_EXPIRES_AT_KEY).is_some());
        assert!(f.coordinator.wait_for_refresh().is_none());
    }

    #[tokio::test]
    async fn failed_refresh_reaches_every_waiter_and_logs_out() {
        let refresher =
            GatedRefresher::new(Err(ApiError::from_response_body(401, r#"{"error":"Login required","code":"LOGIN_REQUIRED","details":{"login_url":"/api/auth/login"}}"#)));
        let f = fixture(refresher.clone());

        let waiters: Vec<_> = (0..4).map(|_| f.coordinator.refresh_token()).collect();
        refresher.release();
        let results = futures::future::join_all(waiters).await;

        let expected = Err(RefreshError::LoginRequired {
            login_url: "/api/auth/login".to_string(),
        });
        for result in results {
            assert_eq!(result, expected);
        }
        assert_eq!(refresher.calls(), 1);
        assert!(f.coordinator.access_token().is_none());
        assert!(f.storage.get_item(REFRESH_HANDLE_KEY).is_none());
        assert_eq!(f.storage.get_item(DEVICE_ID_KEY).as_deref(), Some("device-1"));
        assert_eq!(f.navigator.visits(), vec!["/login?returnUrl=%2Flessons".to_string()]);
    }

    #[tokio::test]
    async fn transient_failure_is_reported_as_failed() {
        let refresher = GatedRefresher::new(Err(ApiError::request_failed("connection refused")));
        let f = fixture(refresher.clone());
        refresher.release();

        let result = f.coordinator.refresh_token().await;
        assert!(matches!(result, Err(RefreshError::Failed(ref err)) if err.code == "REQUEST_FAILED"));
        assert!(f.coordinator.access_token().is_none());
    }

    #[tokio::test]
    async fn refresh_survives_dropped_waiters() {
        let refresher = GatedRefresher::new(Ok("fresh".to_string()));
        let f = fixture(refresher.clone());

        drop(f.coordinator.begin_refresh());
        let late = f.coordinator.wait_for_refresh().expect("refresh still in flight");
        refresher.release();

        assert_eq!(late.await, Ok("fresh".to_string()));
        assert_eq!(f.coordinator.access_token().as_deref(), Some("fresh"));
    }

    #[tokio::test]
    async fn missing_credentials_skip_the_exchange() {
        let refresher = GatedRefresher::new(Ok("fresh".to_string()));
        let f = fixture(refresher.clone());
        f.storage.remove_item(REFRESH_HANDLE_KEY);

        let result = f.coordinator.refresh_token().await;
        assert_eq!(result, Err(RefreshError::MissingCredentials));
        assert_eq!(refresher.calls(), 0);
        assert_eq!(f.navigator.visits().len(), 1);
    }

    #[tokio::test]
    async fn a_new_refresh_starts_after_the_previous_one_settles() {
        let refresher = GatedRefresher::new(Ok("fresh".to_string()));
        let f = fixture(refresher.clone());
        refresher.release();

        f.coordinator.refresh_token().await.unwrap();
        f.coordinator.refresh_token().await.unwrap();
        assert_eq!(refresher.calls(), 2);
    }
}
