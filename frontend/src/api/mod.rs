mod auth;
pub mod client;
mod sessions;
pub mod types;

pub use client::ApiClient;
pub use types::*;
