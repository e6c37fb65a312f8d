//! WebSocket Game Server
//!
//! Accept loop, per-socket tasks and background sweepers. Each socket gets
//! a read loop plus a dedicated sender task fed by a bounded channel; the
//! sender task also owns the heartbeat. All state lives behind the shared
//! [`Ctx`], never on the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{accept_async_with_config, tungstenite::Message};

use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::network::broadcast::{BroadcastConfig, Broadcaster};
use crate::network::connection::{ConnectionConfig, ConnectionId, ConnectionManager};
use crate::network::handlers;
use crate::network::protocol::{ClientMessage, ServerMessage};
use crate::store::rate_limit::RateLimiter;
use crate::store::{DataStore, StoreConfig};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest accepted inbound frame.
    pub max_inbound_bytes: usize,
    /// Inbound messages allowed per IP per window.
    pub message_points: u32,
    /// Inbound message window.
    pub message_window: Duration,
    /// Game actions allowed per connection per window.
    pub action_points: u32,
    /// Game action window.
    pub action_window: Duration,
    /// Reconnection window after a socket drops.
    pub disconnect_grace: Duration,
    /// Between-round countdown length in seconds.
    pub countdown_secs: u32,
    /// Server version string.
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:5000".parse().expect("static addr"),
            max_connections: 1000,
            max_inbound_bytes: 100 * 1024,
            message_points: 30,
            message_window: Duration::from_secs(60),
            action_points: 10,
            action_window: Duration::from_secs(10),
            disconnect_grace: Duration::from_secs(15),
            countdown_secs: 3,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults overridden from the environment (`BIND_ADDR`, `PORT`,
    /// `MAX_CONNECTIONS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("BIND_ADDR") {
            match addr.parse() {
                Ok(parsed) => config.bind_addr = parsed,
                Err(e) => warn!(%addr, error = %e, "ignoring invalid BIND_ADDR"),
            }
        } else if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(parsed) => config.bind_addr.set_port(parsed),
                Err(e) => warn!(%port, error = %e, "ignoring invalid PORT"),
            }
        }
        if let Ok(max) = std::env::var("MAX_CONNECTIONS") {
            if let Ok(parsed) = max.parse() {
                config.max_connections = parsed;
            }
        }
        config
    }
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    /// WebSocket error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Everything the handlers need, shared across socket tasks.
pub(crate) struct Ctx {
    /// Server settings.
    pub config: ServerConfig,
    /// Authoritative lobby/game registry.
    pub store: Arc<DataStore>,
    /// Live socket registry.
    pub connections: Arc<ConnectionManager>,
    /// Snapshot fan-out engine.
    pub broadcaster: Arc<Broadcaster>,
    /// Per-IP inbound message limiter.
    pub message_limiter: RateLimiter,
    /// Per-connection game action limiter.
    pub action_limiter: RateLimiter,
}

impl Ctx {
    pub(crate) fn new(
        config: ServerConfig,
        store_config: StoreConfig,
        connection_config: ConnectionConfig,
    ) -> Arc<Self> {
        let store = Arc::new(DataStore::new(store_config));
        let connections = Arc::new(ConnectionManager::new(connection_config));
        let broadcaster = Arc::new(Broadcaster::new(
            BroadcastConfig::default(),
            store.clone(),
            connections.clone(),
        ));
        let message_limiter = RateLimiter::new(config.message_points, config.message_window);
        let action_limiter = RateLimiter::new(config.action_points, config.action_window);

        Arc::new(Self {
            config,
            store,
            connections,
            broadcaster,
            message_limiter,
            action_limiter,
        })
    }
}

/// The game server.
pub struct GameServer {
    ctx: Arc<Ctx>,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    /// Create a server with the given configuration.
    pub fn new(
        config: ServerConfig,
        store_config: StoreConfig,
        connection_config: ConnectionConfig,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            ctx: Ctx::new(config, store_config, connection_config),
            shutdown_tx,
        }
    }

    /// Run the server until shutdown.
    pub async fn run(&self) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.ctx.config.bind_addr).await?;
        info!("Game server listening on {}", self.ctx.config.bind_addr);

        // Background sweepers: store TTL eviction and dead-connection
        // cleanup. Both stop on the shutdown signal.
        let sweep_store = self.ctx.store.clone();
        let sweep_store_rx = self.shutdown_tx.subscribe();
        let store_sweeper = tokio::spawn(async move {
            sweep_store.run_sweeper(sweep_store_rx).await;
        });

        let sweep_connections = self.ctx.connections.clone();
        let sweep_connections_rx = self.shutdown_tx.subscribe();
        let connection_sweeper = tokio::spawn(async move {
            sweep_connections.run_sweeper(sweep_connections_rx).await;
        });

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.ctx.connections.count().await >= self.ctx.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            let ctx = self.ctx.clone();
                            let shutdown_rx = self.shutdown_tx.subscribe();
                            tokio::spawn(async move {
                                handle_connection(ctx, stream, addr, shutdown_rx).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        store_sweeper.abort();
        connection_sweeper.abort();
        Ok(())
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Registered connection count.
    pub async fn connection_count(&self) -> usize {
        self.ctx.connections.count().await
    }

    /// Store counters for the monitoring boundary.
    pub async fn store_stats(&self) -> crate::store::StoreStats {
        self.ctx.store.stats().await
    }

    /// Connection counters for the monitoring boundary.
    pub async fn connection_stats(&self) -> crate::network::connection::ConnectionStats {
        self.ctx.connections.stats().await
    }
}

/// Drive one accepted socket to completion.
async fn handle_connection(
    ctx: Arc<Ctx>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let ws_config = WebSocketConfig {
        max_message_size: Some(ctx.config.max_inbound_bytes),
        max_frame_size: Some(ctx.config.max_inbound_bytes),
        ..Default::default()
    };
    let ws_stream = match accept_async_with_config(stream, Some(ws_config)).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (msg_tx, mut msg_rx) = mpsc::channel::<ServerMessage>(64);

    let connection_id: ConnectionId = Uuid::new_v4();
    let ip = addr.ip().to_string();
    ctx.connections
        .register(connection_id, ip.clone(), None, msg_tx.clone())
        .await;

    // Sender task: serializes frames and owns the heartbeat ping.
    let heartbeat = ctx.connections.config().heartbeat_interval;
    let sender_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(heartbeat);
        ping.tick().await;
        loop {
            tokio::select! {
                msg = msg_rx.recv() => {
                    let Some(msg) = msg else { break };
                    let text = match msg.to_json() {
                        Ok(t) => t,
                        Err(e) => {
                            error!("Failed to serialize message: {}", e);
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Read loop.
    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if !ctx.message_limiter.try_consume(&ip) {
                            let _ = msg_tx
                                .try_send(ServerMessage::error("Rate limit exceeded. Please slow down."));
                            continue;
                        }
                        ctx.connections.record_activity(connection_id).await;

                        match ClientMessage::from_json(&text) {
                            Ok(client_msg) => {
                                handlers::route(&ctx, connection_id, client_msg).await;
                            }
                            Err(e) => {
                                debug!("Invalid message from {}: {}", addr, e);
                                ctx.connections.record_error(connection_id).await;
                                let _ = msg_tx
                                    .try_send(ServerMessage::error("Invalid message format"));
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        ctx.connections.record_activity(connection_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} disconnected", addr);
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", addr, e);
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown_rx.recv() => {
                break;
            }
        }
    }

    // Cleanup: drop the registry record now; occupancy in lobby/game gets
    // a grace period for reconnection before the player is removed.
    let record = ctx.connections.unregister(connection_id).await;
    sender_task.abort();

    if let Some(record) = record {
        if let (Some(nick), Some(lobby_id)) = (record.nick, record.lobby_id) {
            let grace = ctx.config.disconnect_grace;
            info!(
                %lobby_id,
                nick,
                grace_secs = grace.as_secs(),
                "socket closed, starting reconnect grace period"
            );
            let ctx = ctx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if ctx.connections.has_active_player(lobby_id, &nick).await {
                    info!(%lobby_id, %nick, "player reconnected within grace period");
                } else {
                    info!(%lobby_id, %nick, "grace period expired, removing player");
                    handlers::finalize_departure(&ctx, lobby_id, &nick).await;
                }
            });
        }
    }

    debug!("Client {} cleaned up", addr);
}
