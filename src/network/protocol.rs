//! Protocol Messages
//!
//! Wire format for client-server communication over WebSocket. All frames
//! are JSON with a `type` tag. Every inbound message is checked against
//! its per-type rules before any handler runs; failures carry a field
//! issue list back to the sender and mutate nothing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::game::player::PlayerState;
use crate::game::round::PlayerAction;
use crate::game::session::PublicGameState;
use crate::store::Lobby;

/// Nick length bounds.
const NICK_MIN: usize = 2;
const NICK_MAX: usize = 20;
/// Lobby name length bounds.
const LOBBY_NAME_MIN: usize = 1;
const LOBBY_NAME_MAX: usize = 20;
/// Seat capacity bounds.
const MAX_PLAYERS_MIN: usize = 1;
const MAX_PLAYERS_MAX: usize = 4;

// =============================================================================
// CLIENT -> SERVER MESSAGES
// =============================================================================

/// Messages sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Create a lobby and join it as host.
    #[serde(rename_all = "camelCase")]
    CreateLobby {
        /// Requested nick.
        nick: String,
        /// Lobby display name.
        lobby_name: String,
        /// Seat capacity.
        max_players: usize,
        /// Fill empty seats with bots on start.
        use_bots: bool,
    },

    /// Join an existing lobby.
    #[serde(rename_all = "camelCase")]
    JoinLobby {
        /// Joining nick.
        nick: String,
        /// Target lobby id (UUID).
        lobby_id: String,
    },

    /// Leave a lobby. Keyed by lobby id; the name is display data only.
    #[serde(rename_all = "camelCase")]
    LeaveLobby {
        /// Leaving nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },

    /// Request the current lobby list.
    PingLobbies,

    /// Start the game (host only).
    #[serde(rename_all = "camelCase")]
    StartGame {
        /// Requesting nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },

    /// Bind this connection to a running game's broadcasts.
    #[serde(rename_all = "camelCase")]
    SubscribeToGame {
        /// Subscribing nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },

    /// Signal readiness for the next round.
    #[serde(rename_all = "camelCase")]
    PlayerReady {
        /// Ready nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },

    /// Restart the game (host only).
    #[serde(rename_all = "camelCase")]
    RestartGame {
        /// Requesting nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },

    /// Take a turn action.
    #[serde(rename_all = "camelCase")]
    PlayerAction {
        /// Acting nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
        /// The action to take.
        action: PlayerAction,
    },

    /// Leave a running game (and its lobby).
    #[serde(rename_all = "camelCase")]
    LeaveGame {
        /// Leaving nick.
        nick: String,
        /// Lobby id (UUID).
        lobby_id: String,
    },
}

// =============================================================================
// SERVER -> CLIENT MESSAGES
// =============================================================================

/// Messages sent from server to client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Confirmation that the sender is now in a lobby.
    JoinedLobby {
        /// The joined nick.
        nick: String,
        /// Lobby snapshot.
        lobby: Lobby,
    },

    /// A lobby's membership or settings changed.
    LobbyUpdate {
        /// Lobby snapshot.
        lobby: Lobby,
    },

    /// The full lobby list.
    LobbyListUpdate {
        /// Deep-copied lobby snapshots.
        lobbies: Vec<Lobby>,
    },

    /// Confirmation that the sender left a lobby.
    #[serde(rename_all = "camelCase")]
    LeftLobby {
        /// Lobby id.
        lobby_id: Uuid,
        /// Leaving nick.
        nick: String,
    },

    /// A game started in the sender's lobby.
    #[serde(rename_all = "camelCase")]
    GameStarted {
        /// Lobby id.
        lobby_id: Uuid,
    },

    /// Confirmation of a game subscription.
    #[serde(rename_all = "camelCase")]
    SubscribedToGame {
        /// Lobby id.
        lobby_id: Uuid,
    },

    /// Public game state: what everyone at the table may see.
    #[serde(rename_all = "camelCase")]
    GameStatePublic {
        /// Public projection.
        game_state: PublicGameState,
    },

    /// Private game state: the recipient's own player state.
    #[serde(rename_all = "camelCase")]
    GameStatePrivate {
        /// The recipient's state.
        player_state: PlayerState,
    },

    /// Confirmation that the sender left a game.
    #[serde(rename_all = "camelCase")]
    LeftGame {
        /// Lobby id.
        lobby_id: Uuid,
    },

    /// Tick of the between-round countdown.
    #[serde(rename_all = "camelCase")]
    CountdownUpdate {
        /// Lobby id.
        lobby_id: Uuid,
        /// Seconds remaining.
        seconds: u32,
    },

    /// Request failed; nothing was mutated.
    Error {
        /// Human-readable message.
        message: String,
        /// Field-level issues, when validation failed.
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<Vec<ValidationIssue>>,
    },
}

impl ServerMessage {
    /// Error frame with just a message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            details: None,
        }
    }

    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

impl ClientMessage {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON string.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// One failed field check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Offending field.
    pub field: String,
    /// What was wrong with it.
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

fn check_nick(nick: &str, issues: &mut Vec<ValidationIssue>) {
    let len = nick.chars().count();
    if !(NICK_MIN..=NICK_MAX).contains(&len) {
        issues.push(ValidationIssue::new(
            "nick",
            format!("must be {NICK_MIN}-{NICK_MAX} characters"),
        ));
        return;
    }
    if !nick
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        issues.push(ValidationIssue::new(
            "nick",
            "may only contain letters, digits, '_' and '-'",
        ));
    }
}

fn check_lobby_id(lobby_id: &str, issues: &mut Vec<ValidationIssue>) {
    if Uuid::parse_str(lobby_id).is_err() {
        issues.push(ValidationIssue::new("lobbyId", "must be a UUID"));
    }
}

/// Check an inbound message against its per-type rules.
pub fn validate(msg: &ClientMessage) -> Result<(), Vec<ValidationIssue>> {
    let mut issues = Vec::new();

    match msg {
        ClientMessage::CreateLobby {
            nick,
            lobby_name,
            max_players,
            ..
        } => {
            check_nick(nick, &mut issues);
            let name_len = lobby_name.chars().count();
            if !(LOBBY_NAME_MIN..=LOBBY_NAME_MAX).contains(&name_len) {
                issues.push(ValidationIssue::new(
                    "lobbyName",
                    format!("must be {LOBBY_NAME_MIN}-{LOBBY_NAME_MAX} characters"),
                ));
            }
            if !(MAX_PLAYERS_MIN..=MAX_PLAYERS_MAX).contains(max_players) {
                issues.push(ValidationIssue::new(
                    "maxPlayers",
                    format!("must be between {MAX_PLAYERS_MIN} and {MAX_PLAYERS_MAX}"),
                ));
            }
        }
        ClientMessage::JoinLobby { nick, lobby_id }
        | ClientMessage::LeaveLobby { nick, lobby_id }
        | ClientMessage::StartGame { nick, lobby_id }
        | ClientMessage::SubscribeToGame { nick, lobby_id }
        | ClientMessage::PlayerReady { nick, lobby_id }
        | ClientMessage::RestartGame { nick, lobby_id }
        | ClientMessage::LeaveGame { nick, lobby_id }
        | ClientMessage::PlayerAction { nick, lobby_id, .. } => {
            check_nick(nick, &mut issues);
            check_lobby_id(lobby_id, &mut issues);
        }
        ClientMessage::PingLobbies => {}
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}
