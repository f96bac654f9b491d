pub mod coordinator;
pub mod device;
pub mod redirect;

pub use coordinator::{RefreshCoordinator, RefreshError, TokenRefresher};
pub use redirect::{HeadlessNavigator, LoginRedirector, Navigator};
