//! Connection Registry
//!
//! Tracks every live socket's metadata independently of game and lobby
//! logic. Each socket gets an explicit [`ConnectionRecord`] keyed by
//! connection id — nothing is ever attached to the transport object.
//! Nick and lobby are bound lazily once the client identifies itself.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::network::protocol::ServerMessage;

/// Unique connection identifier.
pub type ConnectionId = Uuid;

/// Liveness and sweep timing.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// A connection is "active" if it sent something this recently.
    pub activity_timeout: Duration,
    /// Even-open connections idle this long are dropped (dead peers).
    pub stale_timeout: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Server ping period.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            activity_timeout: Duration::from_secs(30),
            stale_timeout: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(25),
        }
    }
}

/// Metadata for one live socket.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    /// Connection id.
    pub id: ConnectionId,
    /// Peer address.
    pub ip: String,
    /// Accept time (wall clock).
    pub connected_at: DateTime<Utc>,
    /// Client user agent, if sent.
    pub user_agent: Option<String>,
    /// Bound nick, once the client identified itself.
    pub nick: Option<String>,
    /// Bound lobby, once the client joined one.
    pub lobby_id: Option<Uuid>,
    /// Whether the client is in a running game (excluded from lobby-list
    /// pushes).
    pub in_game: bool,
    /// Inbound messages seen.
    pub message_count: u64,
    /// Failures attributed to this socket.
    pub error_count: u64,
    /// Last inbound activity (monotonic).
    pub last_activity: Instant,
}

struct ConnectionEntry {
    record: ConnectionRecord,
    sender: mpsc::Sender<ServerMessage>,
}

/// A broadcast target: enough to address one socket.
#[derive(Debug, Clone)]
pub struct Recipient {
    /// Connection id.
    pub id: ConnectionId,
    /// Bound nick, if any.
    pub nick: Option<String>,
    /// Outbound channel into the socket's sender task.
    pub sender: mpsc::Sender<ServerMessage>,
}

/// Aggregate counters for the monitoring collaborator.
#[derive(Debug, Clone, Default)]
pub struct ConnectionStats {
    /// Connections considered active right now.
    pub active_count: usize,
    /// All registered connections.
    pub total_count: usize,
    /// Mean messages per connection.
    pub avg_message_rate: f64,
    /// Errors per message.
    pub error_rate: f64,
    /// Connections per lobby.
    pub connections_by_lobby: BTreeMap<Uuid, usize>,
}

/// Registry of live sockets.
pub struct ConnectionManager {
    config: ConnectionConfig,
    connections: RwLock<BTreeMap<ConnectionId, ConnectionEntry>>,
}

impl ConnectionManager {
    /// Create a registry with the given timings.
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            connections: RwLock::new(BTreeMap::new()),
        }
    }

    /// Liveness and sweep timing.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Track a newly accepted socket.
    pub async fn register(
        &self,
        id: ConnectionId,
        ip: String,
        user_agent: Option<String>,
        sender: mpsc::Sender<ServerMessage>,
    ) {
        let record = ConnectionRecord {
            id,
            ip: ip.clone(),
            connected_at: Utc::now(),
            user_agent,
            nick: None,
            lobby_id: None,
            in_game: false,
            message_count: 0,
            error_count: 0,
            last_activity: Instant::now(),
        };
        self.connections
            .write()
            .await
            .insert(id, ConnectionEntry { record, sender });
        debug!(connection_id = %id, %ip, "connection registered");
    }

    /// Drop a connection's record. Returns it for disconnect handling.
    pub async fn unregister(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        let removed = self
            .connections
            .write()
            .await
            .remove(&id)
            .map(|e| e.record);
        if removed.is_some() {
            debug!(connection_id = %id, "connection removed");
        }
        removed
    }

    /// Count an inbound message and refresh liveness.
    pub async fn record_activity(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.record.last_activity = Instant::now();
            entry.record.message_count += 1;
        }
    }

    /// Count a failure against this socket.
    pub async fn record_error(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.record.error_count += 1;
        }
    }

    /// Bind the client's identity once it names itself.
    pub async fn bind_player(&self, id: ConnectionId, nick: &str, lobby_id: Uuid) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.record.nick = Some(nick.to_string());
            entry.record.lobby_id = Some(lobby_id);
        }
    }

    /// Clear the client's lobby binding.
    pub async fn clear_binding(&self, id: ConnectionId) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.record.nick = None;
            entry.record.lobby_id = None;
            entry.record.in_game = false;
        }
    }

    /// Flag one connection as in (or out of) a running game.
    pub async fn set_in_game(&self, id: ConnectionId, in_game: bool) {
        if let Some(entry) = self.connections.write().await.get_mut(&id) {
            entry.record.in_game = in_game;
        }
    }

    /// Flag every connection bound to a lobby as in (or out of) a game.
    pub async fn set_lobby_in_game(&self, lobby_id: Uuid, in_game: bool) {
        let mut connections = self.connections.write().await;
        for entry in connections.values_mut() {
            if entry.record.lobby_id == Some(lobby_id) {
                entry.record.in_game = in_game;
            }
        }
    }

    /// Snapshot one record.
    pub async fn get(&self, id: ConnectionId) -> Option<ConnectionRecord> {
        self.connections.read().await.get(&id).map(|e| e.record.clone())
    }

    /// Outbound channel for one connection.
    pub async fn sender_for(&self, id: ConnectionId) -> Option<mpsc::Sender<ServerMessage>> {
        self.connections.read().await.get(&id).map(|e| e.sender.clone())
    }

    /// Registered connection count (open or not yet swept).
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }

    fn entry_is_active(entry: &ConnectionEntry, now: Instant, timeout: Duration) -> bool {
        !entry.sender.is_closed()
            && now.duration_since(entry.record.last_activity) < timeout
    }

    /// Open, active sockets bound to a lobby.
    pub async fn recipients_for_lobby(&self, lobby_id: Uuid) -> Vec<Recipient> {
        let now = Instant::now();
        let timeout = self.config.activity_timeout;
        self.connections
            .read()
            .await
            .values()
            .filter(|e| e.record.lobby_id == Some(lobby_id))
            .filter(|e| Self::entry_is_active(e, now, timeout))
            .map(|e| Recipient {
                id: e.record.id,
                nick: e.record.nick.clone(),
                sender: e.sender.clone(),
            })
            .collect()
    }

    /// Open, active sockets not currently in a game (lobby-list audience).
    pub async fn lobby_list_recipients(&self) -> Vec<Recipient> {
        let now = Instant::now();
        let timeout = self.config.activity_timeout;
        self.connections
            .read()
            .await
            .values()
            .filter(|e| !e.record.in_game)
            .filter(|e| Self::entry_is_active(e, now, timeout))
            .map(|e| Recipient {
                id: e.record.id,
                nick: e.record.nick.clone(),
                sender: e.sender.clone(),
            })
            .collect()
    }

    /// Whether some open connection is bound to this nick in this lobby.
    /// Used by the disconnect grace period to detect reconnection.
    pub async fn has_active_player(&self, lobby_id: Uuid, nick: &str) -> bool {
        self.connections.read().await.values().any(|e| {
            !e.sender.is_closed()
                && e.record.lobby_id == Some(lobby_id)
                && e.record.nick.as_deref() == Some(nick)
        })
    }

    /// Drop records for sockets that are closed, or idle beyond the stale
    /// timeout even if technically open. Returns the number removed.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale = self.config.stale_timeout;
        let mut connections = self.connections.write().await;

        let to_remove: Vec<ConnectionId> = connections
            .values()
            .filter(|e| {
                e.sender.is_closed()
                    || now.duration_since(e.record.last_activity) > stale
            })
            .map(|e| e.record.id)
            .collect();

        for id in &to_remove {
            if let Some(entry) = connections.remove(id) {
                if !entry.sender.is_closed() {
                    warn!(
                        connection_id = %id,
                        idle_secs = now.duration_since(entry.record.last_activity).as_secs(),
                        "dropping stale connection"
                    );
                }
            }
        }

        if !to_remove.is_empty() {
            info!(count = to_remove.len(), "connection sweep removed records");
        }
        to_remove.len()
    }

    /// Run the periodic sweep until the shutdown signal fires.
    pub async fn run_sweeper(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("connection sweeper stopped");
                    break;
                }
            }
        }
    }

    /// Aggregate counters.
    pub async fn stats(&self) -> ConnectionStats {
        let now = Instant::now();
        let timeout = self.config.activity_timeout;
        let connections = self.connections.read().await;

        let total_count = connections.len();
        let active_count = connections
            .values()
            .filter(|e| Self::entry_is_active(e, now, timeout))
            .count();

        let mut total_messages = 0u64;
        let mut total_errors = 0u64;
        let mut connections_by_lobby: BTreeMap<Uuid, usize> = BTreeMap::new();

        for entry in connections.values() {
            total_messages += entry.record.message_count;
            total_errors += entry.record.error_count;
            if let Some(lobby_id) = entry.record.lobby_id {
                *connections_by_lobby.entry(lobby_id).or_insert(0) += 1;
            }
        }

        let avg_message_rate = if total_count > 0 {
            total_messages as f64 / total_count as f64
        } else {
            0.0
        };
        let error_rate = if total_messages > 0 {
            total_errors as f64 / total_messages as f64
        } else {
            0.0
        };

        ConnectionStats {
            active_count,
            total_count,
            avg_message_rate,
            error_rate,
            connections_by_lobby,
        }
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(ConnectionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registered(
        manager: &ConnectionManager,
    ) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        manager.register(id, "10.0.0.1".to_string(), None, tx).await;
        (id, rx)
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let manager = ConnectionManager::default();
        let (id, _rx) = registered(&manager).await;

        let record = manager.get(id).await.unwrap();
        assert_eq!(record.ip, "10.0.0.1");
        assert_eq!(record.message_count, 0);
        assert!(record.nick.is_none());
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_activity_and_error_counters() {
        let manager = ConnectionManager::default();
        let (id, _rx) = registered(&manager).await;

        manager.record_activity(id).await;
        manager.record_activity(id).await;
        manager.record_error(id).await;

        let record = manager.get(id).await.unwrap();
        assert_eq!(record.message_count, 2);
        assert_eq!(record.error_count, 1);
    }

    #[tokio::test]
    async fn test_lobby_recipients_require_binding() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (bound, _rx1) = registered(&manager).await;
        let (_unbound, _rx2) = registered(&manager).await;

        manager.bind_player(bound, "amy", lobby_id).await;

        let recipients = manager.recipients_for_lobby(lobby_id).await;
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].id, bound);
        assert_eq!(recipients[0].nick.as_deref(), Some("amy"));
    }

    #[tokio::test]
    async fn test_closed_channel_excluded_from_recipients() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (id, rx) = registered(&manager).await;
        manager.bind_player(id, "amy", lobby_id).await;

        drop(rx);
        assert!(manager.recipients_for_lobby(lobby_id).await.is_empty());
    }

    #[tokio::test]
    async fn test_in_game_excluded_from_lobby_list() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (gamer, _rx1) = registered(&manager).await;
        let (idler, _rx2) = registered(&manager).await;

        manager.bind_player(gamer, "amy", lobby_id).await;
        manager.set_lobby_in_game(lobby_id, true).await;

        let recipients = manager.lobby_list_recipients().await;
        assert_eq!(recipients.len(), 1);
        assert_eq!(recipients[0].id, idler);
    }

    #[tokio::test]
    async fn test_sweep_drops_closed_sockets() {
        let manager = ConnectionManager::default();
        let (_open, _rx1) = registered(&manager).await;
        let (closed, rx2) = registered(&manager).await;

        drop(rx2);
        let removed = manager.sweep().await;
        assert_eq!(removed, 1);
        assert!(manager.get(closed).await.is_none());
        assert_eq!(manager.count().await, 1);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_open_sockets() {
        let config = ConnectionConfig {
            stale_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let manager = ConnectionManager::new(config);
        let (id, _rx) = registered(&manager).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = manager.sweep().await;
        assert_eq!(removed, 1);
        assert!(manager.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_has_active_player_tracks_binding() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (id, rx) = registered(&manager).await;
        manager.bind_player(id, "amy", lobby_id).await;

        assert!(manager.has_active_player(lobby_id, "amy").await);
        assert!(!manager.has_active_player(lobby_id, "bob").await);

        drop(rx);
        assert!(!manager.has_active_player(lobby_id, "amy").await);
    }

    #[tokio::test]
    async fn test_clear_binding() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (id, _rx) = registered(&manager).await;
        manager.bind_player(id, "amy", lobby_id).await;
        manager.set_in_game(id, true).await;

        manager.clear_binding(id).await;
        let record = manager.get(id).await.unwrap();
        assert!(record.nick.is_none());
        assert!(record.lobby_id.is_none());
        assert!(!record.in_game);
    }

    #[tokio::test]
    async fn test_stats_aggregation() {
        let manager = ConnectionManager::default();
        let lobby_id = Uuid::new_v4();
        let (a, _rx1) = registered(&manager).await;
        let (b, _rx2) = registered(&manager).await;

        manager.bind_player(a, "amy", lobby_id).await;
        manager.bind_player(b, "bob", lobby_id).await;
        manager.record_activity(a).await;
        manager.record_activity(a).await;
        manager.record_activity(b).await;
        manager.record_error(b).await;

        let stats = manager.stats().await;
        assert_eq!(stats.total_count, 2);
        assert_eq!(stats.active_count, 2);
        assert!((stats.avg_message_rate - 1.5).abs() < f64::EPSILON);
        assert!((stats.error_rate - (1.0 / 3.0)).abs() < 1e-9);
        assert_eq!(stats.connections_by_lobby.get(&lobby_id), Some(&2));
    }
}
