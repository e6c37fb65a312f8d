//! Game Session
//!
//! Composes player, dealer and round state into one addressable game bound
//! to a lobby. The session owns the deck and the phase machine; everything
//! a client sees goes through the projections at the bottom of this file.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::game::cards::Card;
use crate::game::dealer::DealerManager;
use crate::game::player::{PlayerManager, PlayerResult, PlayerState, PlayerStatus};
use crate::game::round::RoundState;

/// Phase of the game bound to a lobby.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    /// Lobby not yet started.
    WaitingForPlayers,
    /// Round over, waiting for humans to ready up (countdown running).
    WaitingForReady,
    /// Players are acting.
    PlayerTurn,
    /// Dealer is drawing.
    DealerTurn,
    /// Round resolved; hole card revealed.
    Finished,
}

/// One game: players, dealer, deck and phase, bound to a lobby id.
///
/// Exactly one session exists per lobby while a round is active; the
/// DataStore owns it and serializes all mutation through the game mutex.
#[derive(Debug)]
pub struct GameSession {
    pub(crate) lobby_id: Uuid,
    pub(crate) players: PlayerManager,
    pub(crate) dealer: DealerManager,
    pub(crate) deck: Vec<Card>,
    pub(crate) current_player: Option<String>,
    pub(crate) status: GameStatus,
    pub(crate) winner: Option<String>,
    pub(crate) round: RoundState,
}

impl GameSession {
    /// Create a session for a lobby and deal the first round immediately.
    pub fn new(lobby_id: Uuid, nicks: &[String]) -> Self {
        let mut session = Self {
            lobby_id,
            players: PlayerManager::new(nicks),
            dealer: DealerManager::new(),
            deck: Vec::new(),
            current_player: None,
            status: GameStatus::WaitingForPlayers,
            winner: None,
            round: RoundState::default(),
        };
        session.start_next_round();
        session
    }

    /// The lobby this game belongs to.
    pub fn lobby_id(&self) -> Uuid {
        self.lobby_id
    }

    /// Current phase.
    pub fn status(&self) -> GameStatus {
        self.status
    }

    /// Nick whose turn it is, if any.
    pub fn current_player(&self) -> Option<&str> {
        self.current_player.as_deref()
    }

    /// Headline winner of the last finished round.
    pub fn winner(&self) -> Option<&str> {
        self.winner.as_deref()
    }

    /// Number of human players still seated.
    pub fn human_count(&self) -> usize {
        self.players.human_nicks().len()
    }

    /// Remove a player mid-game. Clears their readiness and, if it was
    /// their turn, advances it so the round is never stuck on a ghost.
    pub fn remove_player(&mut self, nick: &str) -> bool {
        let removed = self.players.remove_player(nick);
        if !removed {
            return false;
        }
        self.round.ready.remove(nick);

        let was_current = self.current_player.as_deref() == Some(nick);
        if was_current && self.status == GameStatus::PlayerTurn {
            self.advance_turn();
        } else if was_current {
            self.current_player = None;
        }
        true
    }

    /// Whether the dealer's hole card is visible in this phase.
    fn dealer_revealed(&self) -> bool {
        matches!(self.status, GameStatus::DealerTurn | GameStatus::Finished)
    }

    /// Public projection: safe to send to every subscriber of the lobby.
    pub fn public_state(&self) -> PublicGameState {
        let players = self
            .players
            .all()
            .iter()
            .map(|(nick, p)| {
                (
                    nick.clone(),
                    PublicPlayerState {
                        hand: p.hand.clone(),
                        score: p.score,
                        status: p.status,
                        bet: p.bet,
                        balance: p.balance,
                        result: p.result,
                    },
                )
            })
            .collect();

        let reveal = self.dealer_revealed();
        PublicGameState {
            lobby_id: self.lobby_id,
            players,
            dealer: PublicDealerState {
                hand: self.dealer.visible_hand(reveal),
                score: self.dealer.visible_score(reveal),
            },
            current_player_nick: self.current_player.clone(),
            game_status: self.status,
            winner: self.winner.clone(),
        }
    }

    /// Private projection: the recipient's own full player state.
    pub fn player_state(&self, nick: &str) -> Option<PlayerState> {
        self.players.get(nick).cloned()
    }

    /// Clone of every player's state, for per-recipient private sends.
    pub fn player_states(&self) -> BTreeMap<String, PlayerState> {
        self.players.all().clone()
    }
}

// =============================================================================
// PROJECTIONS
// =============================================================================

/// Game state as broadcast to every client in the lobby. Hands, bets and
/// balances are not secret between players; only the dealer's hole card
/// is masked while players act.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicGameState {
    /// Owning lobby.
    pub lobby_id: Uuid,
    /// Player states keyed by nick.
    pub players: BTreeMap<String, PublicPlayerState>,
    /// Dealer projection (hole card masked until reveal).
    pub dealer: PublicDealerState,
    /// Nick whose turn it is.
    pub current_player_nick: Option<String>,
    /// Game phase.
    pub game_status: GameStatus,
    /// Headline winner nick, or the literal `"push"`, once finished.
    pub winner: Option<String>,
}

/// A player's slice of the public projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicPlayerState {
    /// Cards in hand.
    pub hand: Vec<Card>,
    /// Derived score.
    pub score: u32,
    /// Turn status.
    pub status: PlayerStatus,
    /// Current bet.
    pub bet: u32,
    /// Remaining balance.
    pub balance: u32,
    /// Round result once resolved.
    pub result: Option<PlayerResult>,
}

/// Dealer slice of the public projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicDealerState {
    /// Visible hand (hole card masked until reveal).
    pub hand: Vec<Card>,
    /// Visible score (0 until reveal).
    pub score: u32,
}
