//! Transactional Data Store
//!
//! Sole owner of the lobby and game collections. All mutation runs inside
//! one of two independent mutex domains (lobbies, games) so a lobby write
//! never blocks unrelated game mutation; records carry a version for
//! optimistic concurrency and a last-active stamp for TTL eviction.
//!
//! Lock discipline: no lock is held across an await that suspends on I/O
//! or a timer; the sweep takes lobby-then-game and releases in reverse.

pub mod rate_limit;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::game::session::GameSession;
use rate_limit::RateLimiter;

/// A named, capacity-bounded waiting room of player nicks with one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lobby {
    /// Lobby identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Member nicks in join order (bots included once the game starts).
    pub players: Vec<String>,
    /// Seat capacity.
    pub max_players: usize,
    /// Whether empty seats are filled with bots on start.
    pub use_bots: bool,
    /// Whether a game has been started for this lobby.
    pub started: bool,
    /// Host nick; always a member while the lobby is non-empty.
    pub host: Option<String>,
}

/// Stored wrapper: the value plus its concurrency/lifecycle metadata.
///
/// `version` increments by exactly one on every successful mutation and
/// backs the CAS updates; `last_active` feeds the TTL sweep.
#[derive(Debug)]
struct StoredRecord<T> {
    value: T,
    last_active: Instant,
    version: u64,
}

impl<T> StoredRecord<T> {
    fn new(value: T) -> Self {
        Self {
            value,
            last_active: Instant::now(),
            version: 1,
        }
    }
}

/// Store limits and sweep timing.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Maximum concurrent lobbies.
    pub max_lobbies: usize,
    /// Maximum concurrent games.
    pub max_games: usize,
    /// Sweep period.
    pub cleanup_interval: Duration,
    /// Idle time after which a record is evicted.
    pub ttl: Duration,
    /// Lobby creations allowed per IP per window.
    pub lobby_create_points: u32,
    /// Lobby creation window.
    pub lobby_create_window: Duration,
    /// Game creations allowed per IP per window.
    pub game_create_points: u32,
    /// Game creation window.
    pub game_create_window: Duration,
    /// CAS retry bound for `update_*_with_retry`.
    pub max_update_retries: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_lobbies: 100,
            max_games: 50,
            cleanup_interval: Duration::from_secs(5 * 60),
            ttl: Duration::from_secs(30 * 60),
            lobby_create_points: 5,
            lobby_create_window: Duration::from_secs(10),
            game_create_points: 3,
            game_create_window: Duration::from_secs(10),
            max_update_retries: 3,
        }
    }
}

impl StoreConfig {
    /// Defaults overridden from the environment (`MAX_LOBBIES`,
    /// `MAX_GAMES`, `LOBBY_TTL_SECS`, `CLEANUP_INTERVAL_SECS`).
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env_parse("MAX_LOBBIES") {
            config.max_lobbies = max;
        }
        if let Some(max) = env_parse("MAX_GAMES") {
            config.max_games = max;
        }
        if let Some(secs) = env_parse("LOBBY_TTL_SECS") {
            config.ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("CLEANUP_INTERVAL_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Why a record was removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// Explicit deletion.
    Deleted,
    /// TTL sweep eviction.
    Expired,
}

/// Store lifecycle events, consumed by the broadcaster and monitoring.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A lobby was created.
    LobbyAdded(Uuid),
    /// A lobby was removed.
    LobbyRemoved {
        /// Lobby id.
        id: Uuid,
        /// Removal cause.
        reason: RemovalReason,
    },
    /// A game was created.
    GameAdded(Uuid),
    /// A game was removed.
    GameRemoved {
        /// Owning lobby id.
        id: Uuid,
        /// Removal cause.
        reason: RemovalReason,
    },
}

/// Store errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// Per-IP creation limit exceeded.
    #[error("Creation rate limit exceeded")]
    RateLimited,

    /// Collection is at its capacity cap.
    #[error("Capacity limit reached")]
    CapacityExceeded,

    /// A record with this id already exists.
    #[error("Record already exists")]
    AlreadyExists,

    /// No record with this id.
    #[error("Record not found")]
    NotFound,

    /// CAS version mismatch.
    #[error("Version conflict: expected {expected}, actual {actual}")]
    VersionConflict {
        /// Version the caller observed.
        expected: u64,
        /// Version actually stored.
        actual: u64,
    },

    /// CAS retries exhausted without a successful apply.
    #[error("Update failed after {0} attempts")]
    RetriesExhausted(u32),
}

/// Counts exposed to the monitoring collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Current lobby count.
    pub lobbies_count: usize,
    /// Current game count.
    pub games_count: usize,
}

/// The authoritative registry of lobbies and games.
pub struct DataStore {
    config: StoreConfig,
    lobbies: Mutex<BTreeMap<Uuid, StoredRecord<Lobby>>>,
    games: Mutex<BTreeMap<Uuid, StoredRecord<GameSession>>>,
    lobby_create_limiter: RateLimiter,
    game_create_limiter: RateLimiter,
    event_tx: broadcast::Sender<StoreEvent>,
}

impl DataStore {
    /// Create a store with the given limits.
    pub fn new(config: StoreConfig) -> Self {
        let (event_tx, _) = broadcast::channel(64);
        let lobby_create_limiter =
            RateLimiter::new(config.lobby_create_points, config.lobby_create_window);
        let game_create_limiter =
            RateLimiter::new(config.game_create_points, config.game_create_window);

        Self {
            config,
            lobbies: Mutex::new(BTreeMap::new()),
            games: Mutex::new(BTreeMap::new()),
            lobby_create_limiter,
            game_create_limiter,
            event_tx,
        }
    }

    /// Subscribe to store lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_tx.subscribe()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.event_tx.send(event);
    }

    // =========================================================================
    // LOBBIES
    // =========================================================================

    /// Insert a new lobby. Rejects over-rate IPs, a full collection, and
    /// duplicate ids; nothing is mutated on rejection.
    pub async fn create_lobby(&self, lobby: Lobby, ip: &str) -> Result<(), StoreError> {
        if !self.lobby_create_limiter.try_consume(ip) {
            warn!(ip, "lobby creation rate limited");
            return Err(StoreError::RateLimited);
        }

        let mut lobbies = self.lobbies.lock().await;
        if lobbies.len() >= self.config.max_lobbies {
            warn!(max = self.config.max_lobbies, "max lobbies reached");
            return Err(StoreError::CapacityExceeded);
        }
        if lobbies.contains_key(&lobby.id) {
            warn!(id = %lobby.id, "lobby already exists");
            return Err(StoreError::AlreadyExists);
        }

        let id = lobby.id;
        lobbies.insert(id, StoredRecord::new(lobby));
        drop(lobbies);

        self.emit(StoreEvent::LobbyAdded(id));
        Ok(())
    }

    /// Apply `f` to a lobby under the lobby mutex.
    ///
    /// With `expected_version` set this is a CAS: the update only applies
    /// when the stored version matches, and a stale caller gets
    /// [`StoreError::VersionConflict`]. Returns the closure result and the
    /// new version.
    pub async fn update_lobby<R>(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        f: impl FnOnce(&mut Lobby) -> R,
    ) -> Result<(R, u64), StoreError> {
        let mut lobbies = self.lobbies.lock().await;
        let record = lobbies.get_mut(&id).ok_or(StoreError::NotFound)?;

        if let Some(expected) = expected_version {
            if record.version != expected {
                warn!(
                    %id,
                    expected,
                    actual = record.version,
                    "lobby version conflict"
                );
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: record.version,
                });
            }
        }

        let result = f(&mut record.value);
        record.version += 1;
        record.last_active = Instant::now();
        Ok((result, record.version))
    }

    /// CAS update with bounded retry and exponential backoff
    /// (`2^attempt x 10 ms`). Surfaces failure after the retry budget;
    /// callers must not assume success.
    pub async fn update_lobby_with_retry<R>(
        &self,
        id: Uuid,
        mut f: impl FnMut(&mut Lobby) -> R,
    ) -> Result<(R, u64), StoreError> {
        let max_retries = self.config.max_update_retries;
        for attempt in 0..max_retries {
            let version = match self.lobby_version(id).await {
                Some(v) => v,
                None => return Err(StoreError::NotFound),
            };

            match self.update_lobby(id, Some(version), &mut f).await {
                Ok(done) => return Ok(done),
                Err(StoreError::VersionConflict { .. }) => {
                    if attempt + 1 < max_retries {
                        let backoff = Duration::from_millis(10 * (1 << attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        warn!(%id, max_retries, "lobby update retries exhausted");
        Err(StoreError::RetriesExhausted(max_retries))
    }

    /// Read a lobby's current version.
    pub async fn lobby_version(&self, id: Uuid) -> Option<u64> {
        self.lobbies.lock().await.get(&id).map(|r| r.version)
    }

    /// Bump a lobby's last-active stamp (a version-bearing update).
    pub async fn touch_lobby(&self, id: Uuid) -> Result<u64, StoreError> {
        self.update_lobby(id, None, |_| ()).await.map(|(_, v)| v)
    }

    /// Remove a lobby unconditionally. Returns true if it existed.
    pub async fn delete_lobby(&self, id: Uuid) -> bool {
        let removed = self.lobbies.lock().await.remove(&id).is_some();
        if removed {
            self.emit(StoreEvent::LobbyRemoved {
                id,
                reason: RemovalReason::Deleted,
            });
        }
        removed
    }

    /// Deep-copied snapshot of every lobby, safe to serialize without
    /// holding the lock.
    pub async fn lobbies(&self) -> Vec<Lobby> {
        self.lobbies
            .lock()
            .await
            .values()
            .map(|r| r.value.clone())
            .collect()
    }

    /// Deep-copied snapshot of one lobby.
    pub async fn lobby(&self, id: Uuid) -> Option<Lobby> {
        self.lobbies.lock().await.get(&id).map(|r| r.value.clone())
    }

    /// Find the lobby a nick currently occupies, if any.
    pub async fn find_lobby_with_player(&self, nick: &str) -> Option<Lobby> {
        self.lobbies
            .lock()
            .await
            .values()
            .find(|r| r.value.players.iter().any(|p| p == nick))
            .map(|r| r.value.clone())
    }

    // =========================================================================
    // GAMES
    // =========================================================================

    /// Insert a new game, keyed by its lobby id. Same rejection shape as
    /// [`DataStore::create_lobby`]; at most one game per lobby.
    pub async fn create_game(&self, game: GameSession, ip: &str) -> Result<(), StoreError> {
        if !self.game_create_limiter.try_consume(ip) {
            warn!(ip, "game creation rate limited");
            return Err(StoreError::RateLimited);
        }

        let id = game.lobby_id();
        let mut games = self.games.lock().await;
        if games.len() >= self.config.max_games {
            warn!(max = self.config.max_games, "max games reached");
            return Err(StoreError::CapacityExceeded);
        }
        if games.contains_key(&id) {
            warn!(%id, "game already exists for lobby");
            return Err(StoreError::AlreadyExists);
        }

        games.insert(id, StoredRecord::new(game));
        drop(games);

        self.emit(StoreEvent::GameAdded(id));
        Ok(())
    }

    /// Apply `f` to a game under the game mutex. The closure is the only
    /// way to mutate a stored session; see [`DataStore::update_lobby`] for
    /// the CAS contract.
    pub async fn update_game<R>(
        &self,
        id: Uuid,
        expected_version: Option<u64>,
        f: impl FnOnce(&mut GameSession) -> R,
    ) -> Result<(R, u64), StoreError> {
        let mut games = self.games.lock().await;
        let record = games.get_mut(&id).ok_or(StoreError::NotFound)?;

        if let Some(expected) = expected_version {
            if record.version != expected {
                warn!(
                    %id,
                    expected,
                    actual = record.version,
                    "game version conflict"
                );
                return Err(StoreError::VersionConflict {
                    expected,
                    actual: record.version,
                });
            }
        }

        let result = f(&mut record.value);
        record.version += 1;
        record.last_active = Instant::now();
        Ok((result, record.version))
    }

    /// CAS game update with bounded retry; see
    /// [`DataStore::update_lobby_with_retry`].
    pub async fn update_game_with_retry<R>(
        &self,
        id: Uuid,
        mut f: impl FnMut(&mut GameSession) -> R,
    ) -> Result<(R, u64), StoreError> {
        let max_retries = self.config.max_update_retries;
        for attempt in 0..max_retries {
            let version = match self.game_version(id).await {
                Some(v) => v,
                None => return Err(StoreError::NotFound),
            };

            match self.update_game(id, Some(version), &mut f).await {
                Ok(done) => return Ok(done),
                Err(StoreError::VersionConflict { .. }) => {
                    if attempt + 1 < max_retries {
                        let backoff = Duration::from_millis(10 * (1 << attempt));
                        tokio::time::sleep(backoff).await;
                    }
                }
                Err(other) => return Err(other),
            }
        }

        warn!(%id, max_retries, "game update retries exhausted");
        Err(StoreError::RetriesExhausted(max_retries))
    }

    /// Read a game's current version.
    pub async fn game_version(&self, id: Uuid) -> Option<u64> {
        self.games.lock().await.get(&id).map(|r| r.version)
    }

    /// Point-in-time read of a game under the game mutex. The closure
    /// must copy out what it needs; references cannot escape the lock.
    pub async fn with_game<R>(&self, id: Uuid, f: impl FnOnce(&GameSession) -> R) -> Option<R> {
        self.games.lock().await.get(&id).map(|r| f(&r.value))
    }

    /// Whether a game exists for this lobby.
    pub async fn game_exists(&self, id: Uuid) -> bool {
        self.games.lock().await.contains_key(&id)
    }

    /// Ids of every stored game. Monitoring walks these with
    /// [`DataStore::with_game`] to detect stuck rounds.
    pub async fn game_ids(&self) -> Vec<Uuid> {
        self.games.lock().await.keys().copied().collect()
    }

    /// Bump a game's last-active stamp (a version-bearing update).
    pub async fn touch_game(&self, id: Uuid) -> Result<u64, StoreError> {
        self.update_game(id, None, |_| ()).await.map(|(_, v)| v)
    }

    /// Remove a game unconditionally. Returns true if it existed.
    pub async fn delete_game(&self, id: Uuid) -> bool {
        let removed = self.games.lock().await.remove(&id).is_some();
        if removed {
            self.emit(StoreEvent::GameRemoved {
                id,
                reason: RemovalReason::Deleted,
            });
        }
        removed
    }

    // =========================================================================
    // SWEEP / STATS
    // =========================================================================

    /// Evict every lobby and game idle beyond the TTL.
    ///
    /// Takes the lobby mutex then the game mutex; guards drop in reverse
    /// order at the end of the call.
    pub async fn sweep(&self) -> (usize, usize) {
        let mut lobbies = self.lobbies.lock().await;
        let mut games = self.games.lock().await;

        let now = Instant::now();
        let ttl = self.config.ttl;

        let expired_lobbies: Vec<Uuid> = lobbies
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_active) > ttl)
            .map(|(id, _)| *id)
            .collect();
        let expired_games: Vec<Uuid> = games
            .iter()
            .filter(|(_, r)| now.duration_since(r.last_active) > ttl)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired_lobbies {
            lobbies.remove(id);
            self.emit(StoreEvent::LobbyRemoved {
                id: *id,
                reason: RemovalReason::Expired,
            });
        }
        for id in &expired_games {
            games.remove(id);
            self.emit(StoreEvent::GameRemoved {
                id: *id,
                reason: RemovalReason::Expired,
            });
        }

        if !expired_lobbies.is_empty() || !expired_games.is_empty() {
            info!(
                lobbies = expired_lobbies.len(),
                games = expired_games.len(),
                "sweep evicted idle records"
            );
        }

        (expired_lobbies.len(), expired_games.len())
    }

    /// Run the periodic sweep until the shutdown signal fires.
    pub async fn run_sweeper(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.config.cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                _ = shutdown_rx.recv() => {
                    debug!("store sweeper stopped");
                    break;
                }
            }
        }
    }

    /// Current collection sizes.
    pub async fn stats(&self) -> StoreStats {
        let lobbies_count = self.lobbies.lock().await.len();
        let games_count = self.games.lock().await.len();
        StoreStats {
            lobbies_count,
            games_count,
        }
    }
}
