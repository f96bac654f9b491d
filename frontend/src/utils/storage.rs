//! Key/value persistence for auth state, shaped like the browser's
//! `localStorage` so a web-backed implementation can slot in unchanged.

use std::collections::HashMap;
use std::sync::Mutex;

pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const ACCESS_TOKEN_EXPIRES_AT_KEY: &str = "access_token_expires_at";
pub const REFRESH_HANDLE_KEY: &str = "refresh_handle";
pub const SESSION_ID_KEY: &str = "session_id";
pub const CURRENT_USER_KEY: &str = "current_user";
pub const DEVICE_ID_KEY: &str = "device_id";

pub trait Storage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str);
    fn remove_item(&self, key: &str);
}

#[derive(Default)]
pub struct MemoryStorage {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .ok()
            .and_then(|items| items.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) {
        if let Ok(mut items) = self.items.lock() {
            items.insert(key.to_string(), value.to_string());
        }
    }

    fn remove_item(&self, key: &str) {
        if let Ok(mut items) = self.items.lock() {
            items.remove(key);
        }
    }
}

/// Drops every credential. The device id survives logout.
pub fn clear_auth_session(storage: &dyn Storage) {
    for key in [
        ACCESS_TOKEN_KEY,
        ACCESS_TOKEN_EXPIRES_AT_KEY,
        REFRESH_HANDLE_KEY,
        SESSION_ID_KEY,
        CURRENT_USER_KEY,
    ] {
        storage.remove_item(key);
    }
}
