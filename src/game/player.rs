//! Player State
//!
//! Per-player hands, bets and balances. `PlayerManager` is the only writer
//! of this state; scores are recomputed on every hand mutation so they can
//! never diverge from the cards.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::game::cards::Card;
use crate::game::score::calculate_score;
use crate::game::GameError;

/// Balance every player starts with.
pub const STARTING_BALANCE: u32 = 1000;

/// Prefix identifying synthetic players.
const BOT_PREFIX: &str = "Bot";

/// Whether a nick belongs to a bot.
pub fn is_bot(nick: &str) -> bool {
    nick.starts_with(BOT_PREFIX)
}

/// Where a player is within the current round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerStatus {
    /// Has not finished acting this round.
    Waiting,
    /// Currently acting.
    PlayerTurn,
    /// Chose to stand.
    Stand,
    /// Went over 21.
    Bust,
    /// Natural two-card 21.
    Blackjack,
    /// Doubled down (turn over).
    Double,
}

/// Round outcome for a player, set only at round end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerResult {
    /// Beat the dealer.
    Win,
    /// Lost to the dealer (or busted).
    Lose,
    /// Tied with the dealer.
    Push,
    /// Won with a natural two-card 21.
    Blackjack,
}

/// Full per-player state. Also the private-projection wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerState {
    /// Player nickname (unique within a lobby).
    pub nick: String,
    /// Current hand.
    pub hand: Vec<Card>,
    /// Score derived from `hand`.
    pub score: u32,
    /// Turn status.
    pub status: PlayerStatus,
    /// Round result, `None` while the round is live.
    pub result: Option<PlayerResult>,
    /// Current bet.
    pub bet: u32,
    /// Remaining balance.
    pub balance: u32,
}

impl PlayerState {
    fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            hand: Vec::new(),
            score: 0,
            status: PlayerStatus::Waiting,
            result: None,
            bet: 0,
            balance: STARTING_BALANCE,
        }
    }
}

/// Owner of all player state for one game, in seat (join) order.
#[derive(Debug, Default)]
pub struct PlayerManager {
    players: BTreeMap<String, PlayerState>,
    order: Vec<String>,
}

impl PlayerManager {
    /// Create a manager seating the given nicks in order.
    pub fn new(nicks: &[String]) -> Self {
        let mut manager = Self::default();
        for nick in nicks {
            manager.add_player(nick);
        }
        manager
    }

    /// Seat a player. Duplicate nicks are ignored.
    pub fn add_player(&mut self, nick: &str) {
        if self.players.contains_key(nick) {
            return;
        }
        self.players.insert(nick.to_string(), PlayerState::new(nick));
        self.order.push(nick.to_string());
    }

    /// Remove a player. Returns true if they were seated.
    pub fn remove_player(&mut self, nick: &str) -> bool {
        if self.players.remove(nick).is_some() {
            self.order.retain(|n| n != nick);
            true
        } else {
            false
        }
    }

    /// Seat order (join order, bots interleaved where they joined).
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// All players keyed by nick.
    pub fn all(&self) -> &BTreeMap<String, PlayerState> {
        &self.players
    }

    /// Look up a player.
    pub fn get(&self, nick: &str) -> Option<&PlayerState> {
        self.players.get(nick)
    }

    /// Look up a player mutably.
    pub fn get_mut(&mut self, nick: &str) -> Option<&mut PlayerState> {
        self.players.get_mut(nick)
    }

    /// Seated player count.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no players are seated.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Nicks of human (non-bot) players, in seat order.
    pub fn human_nicks(&self) -> Vec<String> {
        self.order.iter().filter(|n| !is_bot(n)).cloned().collect()
    }

    /// Reset every player for a fresh round. Balances persist.
    pub fn reset_for_round(&mut self) {
        for player in self.players.values_mut() {
            player.hand.clear();
            player.score = 0;
            player.status = PlayerStatus::Waiting;
            player.result = None;
            player.bet = 0;
        }
    }

    /// Deal one card to a player, recomputing their score.
    pub fn deal(&mut self, nick: &str, card: Card) {
        if let Some(player) = self.players.get_mut(nick) {
            player.hand.push(card);
            player.score = calculate_score(&player.hand);
        }
    }

    /// Hit: draw one card. Busts the player if they go over 21; otherwise
    /// they stay `waiting` and keep the turn.
    pub fn hit(&mut self, nick: &str, card: Card) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(nick)
            .ok_or_else(|| GameError::PlayerNotFound(nick.to_string()))?;
        player.hand.push(card);
        player.score = calculate_score(&player.hand);
        if player.score > 21 {
            player.status = PlayerStatus::Bust;
        }
        Ok(())
    }

    /// Stand: end the player's turn.
    pub fn stand(&mut self, nick: &str) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(nick)
            .ok_or_else(|| GameError::PlayerNotFound(nick.to_string()))?;
        player.status = PlayerStatus::Stand;
        Ok(())
    }

    /// Double down: stake another bet, draw exactly one card, and end the
    /// turn unconditionally. Requires `balance >= bet`.
    pub fn double(&mut self, nick: &str, card: Card) -> Result<(), GameError> {
        let player = self
            .players
            .get_mut(nick)
            .ok_or_else(|| GameError::PlayerNotFound(nick.to_string()))?;
        if player.balance < player.bet {
            return Err(GameError::InsufficientBalance);
        }
        player.balance -= player.bet;
        player.bet *= 2;
        player.hand.push(card);
        player.score = calculate_score(&player.hand);
        player.status = if player.score > 21 {
            PlayerStatus::Bust
        } else {
            PlayerStatus::Stand
        };
        Ok(())
    }
}
