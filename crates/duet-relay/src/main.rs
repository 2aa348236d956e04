//! Duet relay server.
//!
//! A WebSocket relay for one-to-one conversations: presence, delivery and
//! read receipts, typing indicators, and a small authenticated HTTP API.

mod api;
mod auth;
mod config;
mod delivery;
mod gateway;
mod presence;
mod protocol;
mod relay;
mod session;
mod storage;
mod typing;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use config::RelayConfig;
use relay::RelayState;
use storage::Storage;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = RelayConfig::from_env();
    let storage = Storage::open(Path::new(&config.db_path)).inspect_err(|e| {
        tracing::error!("Failed to open database {}: {e}", config.db_path);
    })?;
    let state = Arc::new(RelayState::new(&config, Arc::new(storage)));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!("Duet relay listening on {}", config.addr);
    tracing::info!("WebSocket: ws://{}/ws", config.addr);
    tracing::info!("HTTP API:  http://{}/api/", config.addr);

    axum::serve(listener, app).await?;
    Ok(())
}
