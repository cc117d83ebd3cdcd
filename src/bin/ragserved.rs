//! RAG server daemon
//!
//! Loads configuration, initializes the vector store, and serves the HTTP
//! API until interrupted.

use ragserve::{api, config::AppConfig, state::AppState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = std::env::args().nth(1);
    let config = AppConfig::resolve(config_path.as_deref())?;
    let addr = format!("{}:{}", config.server.host, config.server.port);

    info!("ragserve {} starting", ragserve::VERSION);
    let state = AppState::new(config).await?;
    let shutdown_state = state.clone();
    let router = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received, draining connections");
            shutdown_state.store.close().await;
        })
        .await?;

    Ok(())
}
