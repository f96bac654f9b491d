//! Persistence for sessions. Postgres in production, in-memory for tests and
//! single-node development.

pub mod session;

pub use session::*;
