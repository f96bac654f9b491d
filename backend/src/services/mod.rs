pub mod identity_provider;
pub mod pkce;
pub mod session_lifecycle;
pub mod token_cache;
pub mod token_issuance;

pub use identity_provider::{HttpIdentityProvider, IdentityProvider, IdpError, IdpSettings};
pub use session_lifecycle::{SessionError, SessionService};
pub use token_issuance::{AccessTokenOutcome, AuthError, AuthEvent, TokenIssuanceService};
