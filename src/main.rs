//! Blackjack Lobby Server
//!
//! Process bootstrap: logging, environment configuration, and the server
//! run loop.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use blackjack::network::{ConnectionConfig, GameServer, ServerConfig};
use blackjack::store::StoreConfig;
use blackjack::VERSION;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServerConfig::from_env();
    let store_config = StoreConfig::from_env();

    info!("Blackjack Lobby Server v{}", VERSION);
    info!("Bind address: {}", config.bind_addr);
    info!(
        "Limits: {} connections, {} lobbies, {} games",
        config.max_connections, store_config.max_lobbies, store_config.max_games
    );

    let server = GameServer::new(config, store_config, ConnectionConfig::default());

    tokio::select! {
        result = server.run() => {
            result.context("server terminated with an error")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupt received, shutting down");
            server.shutdown();
        }
    }

    Ok(())
}
