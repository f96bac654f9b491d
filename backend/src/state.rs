use std::sync::Arc;

use crate::{
    config::Config,
    services::{SessionService, TokenIssuanceService},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub sessions: SessionService,
    pub issuance: Arc<TokenIssuanceService>,
}

impl AppState {
    pub fn new(config: Config, sessions: SessionService, issuance: TokenIssuanceService) -> Self {
        Self {
            config: Arc::new(config),
            sessions,
            issuance: Arc::new(issuance),
        }
    }
}
