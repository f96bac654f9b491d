use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

/// Where the user is and how to send them elsewhere. The browser build backs
/// this with `window.location`.
pub trait Navigator: Send + Sync {
    fn current_path(&self) -> String;
    fn navigate(&self, url: &str);
}

/// Navigator for non-browser hosts: tracks the location in memory.
#[derive(Default)]
pub struct HeadlessNavigator {
    state: Mutex<HeadlessState>,
}

#[derive(Default)]
struct HeadlessState {
    path: String,
    visits: Vec<String>,
}

impl HeadlessNavigator {
    pub fn at(path: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(HeadlessState {
                path: path.into(),
                visits: Vec::new(),
            }),
        }
    }

    pub fn visits(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.visits.clone())
            .unwrap_or_default()
    }
}

impl Navigator for HeadlessNavigator {
    fn current_path(&self) -> String {
        self.state
            .lock()
            .map(|state| state.path.clone())
            .unwrap_or_default()
    }

    fn navigate(&self, url: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.path = url.split('?').next().unwrap_or(url).to_string();
            state.visits.push(url.to_string());
        }
    }
}

/// Sends the user to the login page with a `returnUrl`, at most once per
/// cool-down window.
pub struct LoginRedirector {
    navigator: Arc<dyn Navigator>,
    login_path: String,
    cooldown: Duration,
    last_redirect: Mutex<Option<Instant>>,
}

impl LoginRedirector {
    pub fn new(navigator: Arc<dyn Navigator>, login_path: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            navigator,
            login_path: login_path.into(),
            cooldown,
            last_redirect: Mutex::new(None),
        }
    }

    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    pub fn login_url(&self, return_path: &str) -> String {
        format!(
            "{}?returnUrl={}",
            self.login_path,
            utf8_percent_encode(return_path, NON_ALPHANUMERIC)
        )
    }

    /// Returns true when a navigation was issued.
    pub fn redirect_to_login(&self) -> bool {
        let current = self.navigator.current_path();
        if current == self.login_path {
            return false;
        }

        let now = Instant::now();
        {
            let Ok(mut last) = self.last_redirect.lock() else {
                return false;
            };
            if let Some(previous) = *last {
                if now.duration_since(previous) < self.cooldown {
                    log::debug!("Login redirect suppressed during cool-down");
                    return false;
                }
            }
            *last = Some(now);
        }

        let url = self.login_url(&current);
        log::info!("Redirecting to {}", url);
        self.navigator.navigate(&url);
        true
    }
}
