pub mod auth;
pub mod logging;
pub mod trace_context;

pub use auth::*;
pub use logging::*;
pub use trace_context::*;
