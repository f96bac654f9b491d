use std::{sync::Arc, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lessonhub_backend::{
    config::{Config, SessionStoreKind},
    db::connection::create_pool,
    repositories::{InMemorySessionRepository, PgSessionRepository, SessionRepository},
    router::build_router,
    services::{
        pkce::InMemoryVerifierStore, AuthEvent, HttpIdentityProvider, SessionService,
        TokenIssuanceService,
    },
    state::AppState,
};

const TOKEN_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

fn mask_secret(s: Option<&str>) -> String {
    match s {
        None | Some("") => "<empty>".into(),
        Some(s) => {
            let prefix = s.chars().take(4).collect::<String>();
            format!("{}*** (len={})", prefix, s.len())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lessonhub_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!(
        session_store = ?config.session_store,
        idp_issuer = %config.identity_provider.issuer_url,
        idp_client_id = %config.identity_provider.client_id,
        idp_client_secret = %mask_secret(config.identity_provider.client_secret.as_deref()),
        token_refresh_margin_secs = config.token_refresh_margin.as_secs(),
        idp_max_retries = config.idp_retry.max_retries,
        "Loaded configuration from environment/.env"
    );

    // Session storage
    let repository: Arc<dyn SessionRepository> = match config.session_store {
        SessionStoreKind::Postgres => {
            let pool = create_pool(&config.database_url, config.database_max_connections).await?;
            sqlx::migrate!("./migrations").run(&pool).await?;
            Arc::new(PgSessionRepository::new(pool))
        }
        SessionStoreKind::Memory => {
            tracing::warn!("Using in-memory session store; sessions are lost on restart");
            Arc::new(InMemorySessionRepository::new())
        }
    };
    let sessions = SessionService::new(repository);

    let identity_provider = HttpIdentityProvider::new(
        config.identity_provider.clone(),
        config.idp_timeout,
        config.idp_retry.clone(),
    )?;
    let issuance = TokenIssuanceService::new(
        Arc::new(identity_provider),
        sessions.clone(),
        Arc::new(InMemoryVerifierStore::new(config.pkce_verifier_ttl)),
        config.token_refresh_margin,
        config.login_path.clone(),
    );

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, sessions, issuance);
    tokio::spawn(log_auth_events(state.issuance.subscribe()));
    tokio::spawn(prune_token_cache(state.issuance.clone()));

    let app = build_router(state.clone());

    // Start server
    tracing::info!("Server listening on {}", bind_addr);
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    let issuance = state.issuance.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutting down; closing token service");
            issuance.close();
        })
        .await?;

    Ok(())
}

async fn prune_token_cache(issuance: Arc<TokenIssuanceService>) {
    let mut ticker = tokio::time::interval(TOKEN_CACHE_SWEEP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let pruned = issuance.prune_expired_tokens().await;
        if pruned > 0 {
            tracing::debug!(pruned, "Dropped expired token cache entries");
        }
    }
}

async fn log_auth_events(mut events: tokio::sync::broadcast::Receiver<AuthEvent>) {
    loop {
        match events.recv().await {
            Ok(AuthEvent::LoggedIn {
                session_id,
                user_id,
            }) => {
                tracing::info!(%session_id, %user_id, "User logged in");
            }
            Ok(AuthEvent::Refreshed { session_id }) => {
                tracing::debug!(%session_id, "Access token refreshed");
            }
            Ok(AuthEvent::RefreshFailed { session_id }) => {
                tracing::warn!(%session_id, "Token refresh failed; login required");
            }
            Ok(AuthEvent::LoggedOut { session_id }) => {
                tracing::info!(%session_id, "Session logged out");
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Auth event logger lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
