//! Broadcaster
//!
//! Delivers consistent, privacy-respecting snapshots to the right subset
//! of sockets. Reads take deep-copied snapshots under the store locks and
//! fan out afterwards; delivery is per-recipient and best-effort, so one
//! broken socket never blocks the rest.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::game::player::PlayerStatus;
use crate::game::session::{GameStatus, PublicGameState};
use crate::network::connection::{ConnectionId, ConnectionManager, Recipient};
use crate::network::protocol::ServerMessage;
use crate::store::{DataStore, Lobby};

/// Cache timing and delivery limits.
#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    /// How long a lobby-list snapshot may be served from cache.
    pub lobby_cache_ttl: Duration,
    /// Serialized frames above this size are dropped, not sent.
    pub max_frame_bytes: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            lobby_cache_ttl: Duration::from_secs(30),
            max_frame_bytes: 100 * 1024,
        }
    }
}

/// Cached lobby-list snapshot.
struct LobbyCache {
    taken_at: Instant,
    lobbies: Vec<Lobby>,
}

/// Fields compared for differential suppression. Covers everything a
/// recipient can observe change: phase, turn, winner, and per-player hand
/// length, score, status and bet — so a skipped broadcast provably looks
/// identical to the last one sent.
#[derive(Debug, Clone, PartialEq)]
struct StateDigest {
    game_status: GameStatus,
    current_player: Option<String>,
    winner: Option<String>,
    players: BTreeMap<String, PlayerDigest>,
}

#[derive(Debug, Clone, PartialEq)]
struct PlayerDigest {
    hand_len: usize,
    score: u32,
    status: PlayerStatus,
    bet: u32,
}

impl StateDigest {
    fn of(state: &PublicGameState) -> Self {
        Self {
            game_status: state.game_status,
            current_player: state.current_player_nick.clone(),
            winner: state.winner.clone(),
            players: state
                .players
                .iter()
                .map(|(nick, p)| {
                    (
                        nick.clone(),
                        PlayerDigest {
                            hand_len: p.hand.len(),
                            score: p.score,
                            status: p.status,
                            bet: p.bet,
                        },
                    )
                })
                .collect(),
        }
    }
}

/// Snapshot-and-fan-out engine.
pub struct Broadcaster {
    config: BroadcastConfig,
    store: Arc<DataStore>,
    connections: Arc<ConnectionManager>,
    lobby_cache: Mutex<Option<LobbyCache>>,
    game_digests: Mutex<HashMap<Uuid, StateDigest>>,
}

impl Broadcaster {
    /// Create a broadcaster over the store and connection registry.
    pub fn new(
        config: BroadcastConfig,
        store: Arc<DataStore>,
        connections: Arc<ConnectionManager>,
    ) -> Self {
        Self {
            config,
            store,
            connections,
            lobby_cache: Mutex::new(None),
            game_digests: Mutex::new(HashMap::new()),
        }
    }

    /// Send one frame to one recipient. Oversized frames are dropped with
    /// a warning; a refused send counts against the socket's error tally
    /// and nothing else.
    async fn deliver(&self, recipient: &Recipient, message: ServerMessage) {
        let serialized_len = match message.to_json() {
            Ok(json) => json.len(),
            Err(e) => {
                warn!(error = %e, "failed to serialize outbound frame");
                return;
            }
        };
        if serialized_len > self.config.max_frame_bytes {
            warn!(
                connection_id = %recipient.id,
                size = serialized_len,
                limit = self.config.max_frame_bytes,
                "outbound frame too large, dropping"
            );
            return;
        }

        if recipient.sender.try_send(message).is_err() {
            self.connections.record_error(recipient.id).await;
        }
    }

    /// Fan one frame out to every active socket in a lobby.
    pub async fn broadcast_to_lobby(&self, lobby_id: Uuid, message: ServerMessage) {
        let recipients = self.connections.recipients_for_lobby(lobby_id).await;
        for recipient in &recipients {
            self.deliver(recipient, message.clone()).await;
        }
    }

    // =========================================================================
    // LOBBY LIST
    // =========================================================================

    /// Lobby-list snapshot, served from a short-TTL cache unless forced.
    async fn lobby_snapshot(&self, force: bool) -> Vec<Lobby> {
        let mut cache = self.lobby_cache.lock().await;
        if !force {
            if let Some(cached) = cache.as_ref() {
                if cached.taken_at.elapsed() < self.config.lobby_cache_ttl {
                    return cached.lobbies.clone();
                }
            }
        }

        let lobbies = self.store.lobbies().await;
        *cache = Some(LobbyCache {
            taken_at: Instant::now(),
            lobbies: lobbies.clone(),
        });
        lobbies
    }

    /// Push the lobby list to every active socket not currently in a game.
    pub async fn broadcast_lobby_list(&self, force: bool) {
        let lobbies = self.lobby_snapshot(force).await;
        let recipients = self.connections.lobby_list_recipients().await;
        debug!(recipients = recipients.len(), "broadcasting lobby list");

        let message = ServerMessage::LobbyListUpdate { lobbies };
        for recipient in &recipients {
            self.deliver(recipient, message.clone()).await;
        }
    }

    /// Push a fresh lobby list to a single requester.
    pub async fn send_lobby_list_to(&self, id: ConnectionId) {
        let Some(sender) = self.connections.sender_for(id).await else {
            return;
        };
        let lobbies = self.lobby_snapshot(true).await;
        let recipient = Recipient {
            id,
            nick: None,
            sender,
        };
        self.deliver(&recipient, ServerMessage::LobbyListUpdate { lobbies })
            .await;
    }

    /// Push one lobby's state to its members.
    pub async fn broadcast_lobby_update(&self, lobby: &Lobby) {
        self.broadcast_to_lobby(
            lobby.id,
            ServerMessage::LobbyUpdate {
                lobby: lobby.clone(),
            },
        )
        .await;
    }

    // =========================================================================
    // GAME STATE
    // =========================================================================

    /// Broadcast a game's state to its lobby: the public projection to
    /// everyone plus each recipient's own private state.
    ///
    /// Unless `force` is set, a state whose digest matches the last one
    /// sent for this lobby is suppressed entirely. Returns whether
    /// anything was sent.
    pub async fn broadcast_game_state(&self, lobby_id: Uuid, force: bool) -> bool {
        let Some((public, privates)) = self
            .store
            .with_game(lobby_id, |g| (g.public_state(), g.player_states()))
            .await
        else {
            debug!(%lobby_id, "no game to broadcast");
            return false;
        };

        let digest = StateDigest::of(&public);
        {
            let mut digests = self.game_digests.lock().await;
            if !force {
                if let Some(last) = digests.get(&lobby_id) {
                    if *last == digest {
                        debug!(%lobby_id, "suppressing unchanged game state");
                        return false;
                    }
                }
            }
            digests.insert(lobby_id, digest);
        }

        let recipients = self.connections.recipients_for_lobby(lobby_id).await;
        debug!(
            %lobby_id,
            recipients = recipients.len(),
            "broadcasting game state"
        );

        for recipient in &recipients {
            self.deliver(
                recipient,
                ServerMessage::GameStatePublic {
                    game_state: public.clone(),
                },
            )
            .await;

            let private = recipient
                .nick
                .as_ref()
                .and_then(|nick| privates.get(nick).cloned());
            if let Some(player_state) = private {
                self.deliver(recipient, ServerMessage::GameStatePrivate { player_state })
                    .await;
            }
        }
        true
    }

    /// Push the current game state (public + own private) to one socket,
    /// bypassing differential suppression. No-op when no game exists.
    pub async fn send_game_state_to(&self, id: ConnectionId, lobby_id: Uuid) {
        let Some(record) = self.connections.get(id).await else {
            return;
        };
        let Some(sender) = self.connections.sender_for(id).await else {
            return;
        };
        let Some((public, private)) = self
            .store
            .with_game(lobby_id, |g| {
                let private = record.nick.as_deref().and_then(|n| g.player_state(n));
                (g.public_state(), private)
            })
            .await
        else {
            return;
        };

        let recipient = Recipient {
            id,
            nick: record.nick.clone(),
            sender,
        };
        self.deliver(&recipient, ServerMessage::GameStatePublic { game_state: public })
            .await;
        if let Some(player_state) = private {
            self.deliver(&recipient, ServerMessage::GameStatePrivate { player_state })
                .await;
        }
    }

    /// Forget the cached digest for a removed game.
    pub async fn invalidate_game(&self, lobby_id: Uuid) {
        self.game_digests.lock().await.remove(&lobby_id);
    }
}
