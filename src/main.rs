use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use vinyl_exchange::catalog::SledCatalog;
use vinyl_exchange::config::{Config, DEFAULT_LOG_FILTER};
use vinyl_exchange::http::{AppState, build_router};
use vinyl_exchange::service::ExchangeService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    tracing::info!(
        db = %config.db_path.display(),
        users = config.identity.len(),
        "configuration loaded"
    );
    if config.identity.is_empty() {
        tracing::warn!("VINYL_TOKENS is empty, every request will be rejected as unauthenticated");
    }

    let db = Arc::new(sled::open(&config.db_path)?);
    let catalog = Arc::new(SledCatalog::open(&db)?);
    let service = Arc::new(ExchangeService::new(db, catalog)?);
    let state = AppState::new(service.clone(), Arc::new(config.identity.clone()));

    let listener = tokio::net::TcpListener::bind(config.bind_addr()?).await?;
    tracing::info!(addr = %listener.local_addr()?, "vinyl exchange listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.flush()?;
    tracing::info!("shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
