//! Client side of LessonHub authentication: an API client that keeps the
//! access token fresh with a single refresh per session, stamps every call
//! with trace and device headers, and sends the user to the login page once
//! the session is gone.

pub mod api;
pub mod auth;
pub mod config;
pub mod utils;

pub use api::{ApiClient, ApiError};
pub use config::ClientConfig;
