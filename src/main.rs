mod bridge;
mod cancel;
mod config;
mod conversations;
mod db;
mod error;
mod heartbeat;
mod history;
mod llm;
mod logging;
mod protocol;
mod server;
mod session;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use tokio::signal;
use crate::config::load_config;
use crate::db::Database;
use crate::llm::HttpBackendFactory;
use crate::logging::init_logging;
use crate::server::AppState;
use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load config
    let config = load_config()?;

    // 2. Init logging
    let _guard = init_logging(&config)?;
    tracing::info!("chatwire starting up...");

    // 3. Open history database
    let db_path = config.database_path();
    let db = Database::open(&db_path).await?;
    tracing::info!("History database at {}", db_path.display());

    // 4. Backend factory; clients are built per connection on first use
    tracing::info!("Backend model: {}", config.backend.model);
    let factory = Arc::new(HttpBackendFactory::new(config.backend.clone()));

    // 5. Serve until SIGINT/SIGTERM
    let listen_addr = config.listen_addr.clone();
    let state = AppState::new(db.clone(), factory, config);
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        tokio::select! {
            _ = signal::ctrl_c() => {
                tracing::info!("Received SIGINT, shutting down...");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, shutting down...");
            }
        }
    };

    server::start_server(&listen_addr, state, shutdown).await?;

    db.close().await;
    tracing::info!("Shutdown complete.");

    Ok(())
}
