//! Round Lifecycle
//!
//! Dealing, the turn machine, synchronous bot play, the dealer's turn and
//! the readiness loop. Bot turns are an explicit step inside
//! [`GameSession::advance_turn`] rather than recursion tangled into the
//! human action handlers: the scan loop drives every bot it lands on to
//! completion before control returns to the caller.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

use crate::game::bot::{bot_decision, update_bot_status, BotAction};
use crate::game::cards::build_deck;
use crate::game::player::{is_bot, PlayerResult, PlayerStatus};
use crate::game::score::is_blackjack;
use crate::game::session::{GameSession, GameStatus};
use crate::game::winner::{player_result, round_winner};
use crate::game::GameError;

/// An action a seated player may take on their turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerAction {
    /// Draw one card.
    Hit,
    /// End the turn.
    Stand,
    /// Double the bet, draw exactly one card, end the turn.
    Double,
}

/// Per-round bookkeeping: readiness votes and the re-entrancy guards.
///
/// `in_progress` blocks overlapping deals; `countdown_pending` blocks a
/// second countdown from duplicate ready signals while the first is
/// ticking.
#[derive(Debug, Default)]
pub struct RoundState {
    pub(crate) ready: BTreeSet<String>,
    pub(crate) in_progress: bool,
    pub(crate) countdown_pending: bool,
}

impl GameSession {
    /// Start the next round if one is not already running.
    ///
    /// Returns false (and changes nothing) when a round is in progress.
    pub fn start_next_round(&mut self) -> bool {
        if self.round.in_progress {
            warn!(lobby_id = %self.lobby_id, "round already in progress, ignoring start");
            return false;
        }
        self.deal_round();
        true
    }

    /// Host restart: abandon whatever is running and redeal.
    pub fn reset_round(&mut self) {
        self.round.in_progress = false;
        self.round.countdown_pending = false;
        self.deal_round();
    }

    /// Enter the between-round ready phase, taking the countdown guard.
    ///
    /// Returns false if a round or countdown is already underway.
    pub fn begin_countdown(&mut self) -> bool {
        if self.round.in_progress || self.round.countdown_pending {
            return false;
        }
        self.round.countdown_pending = true;
        self.status = GameStatus::WaitingForReady;
        true
    }

    /// Record a human ready vote. Bots are excluded from the count.
    ///
    /// Returns true once every seated human has voted.
    pub fn player_ready(&mut self, nick: &str) -> bool {
        if is_bot(nick) || self.round.in_progress {
            return false;
        }
        if self.players.get(nick).is_none() {
            return false;
        }
        self.round.ready.insert(nick.to_string());
        self.all_humans_ready()
    }

    /// Whether every seated human has signalled ready.
    pub fn all_humans_ready(&self) -> bool {
        let humans = self.players.human_nicks();
        !humans.is_empty() && humans.iter().all(|n| self.round.ready.contains(n))
    }

    /// Whether a round is currently being played.
    pub fn is_round_in_progress(&self) -> bool {
        self.round.in_progress
    }

    /// Deal a fresh round: new shuffled deck, two cards each dealt
    /// round-robin (players in seat order, then dealer, twice), initial
    /// blackjack resolution, then hand the turn to the first waiting seat.
    fn deal_round(&mut self) {
        self.round.in_progress = true;
        self.round.countdown_pending = false;
        self.round.ready.clear();

        self.deck = build_deck();
        self.players.reset_for_round();
        self.dealer.reset();
        self.winner = None;
        self.current_player = None;

        let order: Vec<String> = self.players.order().to_vec();
        info!(lobby_id = %self.lobby_id, players = order.len(), "dealing new round");

        // Round-robin: one card per seat per pass, dealer last.
        for _ in 0..2 {
            for nick in &order {
                if let Some(card) = self.deck.pop() {
                    self.players.deal(nick, card);
                }
            }
            if let Some(card) = self.deck.pop() {
                self.dealer.deal(card);
            }
        }

        // Mark natural blackjacks before anyone acts.
        for nick in &order {
            if let Some(player) = self.players.get_mut(nick) {
                if is_blackjack(&player.hand) {
                    player.status = PlayerStatus::Blackjack;
                }
            }
        }

        // Dealer natural ends the round on the spot: naturals push,
        // everyone else loses, hand revealed.
        if self.dealer.has_blackjack() {
            info!(lobby_id = %self.lobby_id, "dealer blackjack, round over at the deal");
            self.resolve_round(true);
            return;
        }

        self.status = GameStatus::PlayerTurn;
        self.advance_turn();
    }

    /// Guarded player action: only the current player may act, and only
    /// while still `waiting`.
    pub fn player_action(&mut self, nick: &str, action: PlayerAction) -> Result<(), GameError> {
        if self.status != GameStatus::PlayerTurn {
            return Err(GameError::WrongPhase);
        }
        if self.current_player.as_deref() != Some(nick) {
            return Err(GameError::NotYourTurn);
        }
        let status = self
            .players
            .get(nick)
            .ok_or_else(|| GameError::PlayerNotFound(nick.to_string()))?
            .status;
        if status != PlayerStatus::Waiting {
            return Err(GameError::NotYourTurn);
        }

        match action {
            PlayerAction::Hit => {
                let card = self.deck.pop().ok_or(GameError::EmptyDeck)?;
                self.players.hit(nick, card)?;
            }
            PlayerAction::Stand => {
                self.players.stand(nick)?;
            }
            PlayerAction::Double => {
                let card = self.deck.pop().ok_or(GameError::EmptyDeck)?;
                self.players.double(nick, card)?;
            }
        }

        debug!(lobby_id = %self.lobby_id, nick, ?action, "player acted");
        self.advance_turn();
        Ok(())
    }

    /// One step of the turn machine.
    ///
    /// Scans seat order from the current player (inclusive, so a player who
    /// hit without busting keeps the turn) for the next `waiting` seat.
    /// Bots it lands on play synchronously to completion; when no waiting
    /// seat remains, the dealer plays and the round resolves.
    pub(crate) fn advance_turn(&mut self) {
        loop {
            let order: Vec<String> = self.players.order().to_vec();
            let start = self
                .current_player
                .as_ref()
                .and_then(|nick| order.iter().position(|n| n == nick))
                .unwrap_or(0);

            let next = order[start..]
                .iter()
                .find(|nick| {
                    self.players
                        .get(nick)
                        .map(|p| p.status == PlayerStatus::Waiting)
                        .unwrap_or(false)
                })
                .cloned();

            match next {
                Some(nick) if is_bot(&nick) => {
                    self.current_player = Some(nick.clone());
                    self.play_bot(&nick);
                    // Bot is no longer waiting; rescan from its seat.
                }
                Some(nick) => {
                    debug!(lobby_id = %self.lobby_id, %nick, "turn advanced");
                    self.current_player = Some(nick);
                    return;
                }
                None => {
                    self.play_dealer();
                    return;
                }
            }
        }
    }

    /// Drive one bot to completion. Never suspends.
    fn play_bot(&mut self, nick: &str) {
        loop {
            let Some(player) = self.players.get(nick) else {
                return;
            };
            if player.status != PlayerStatus::Waiting {
                return;
            }

            let decision = bot_decision(player, self.dealer.up_card());
            debug!(lobby_id = %self.lobby_id, nick, ?decision, "bot decided");

            match decision {
                BotAction::Hit => {
                    let Some(card) = self.deck.pop() else {
                        let _ = self.players.stand(nick);
                        return;
                    };
                    if let Some(player) = self.players.get_mut(nick) {
                        player.hand.push(card);
                        update_bot_status(player);
                    }
                }
                BotAction::Double => {
                    let Some(card) = self.deck.pop() else {
                        let _ = self.players.stand(nick);
                        return;
                    };
                    if self.players.double(nick, card).is_err() {
                        let _ = self.players.stand(nick);
                    }
                    return;
                }
                BotAction::Stand => {
                    let _ = self.players.stand(nick);
                    return;
                }
            }
        }
    }

    /// Dealer's turn: reveal, draw to 17, then resolve the round.
    fn play_dealer(&mut self) {
        self.status = GameStatus::DealerTurn;
        self.current_player = None;
        info!(lobby_id = %self.lobby_id, "dealer turn started");

        self.dealer.play_turn(&mut self.deck);
        self.resolve_round(false);
    }

    /// Set every player's result and the headline winner, and close out
    /// the round.
    fn resolve_round(&mut self, dealer_blackjack: bool) {
        let dealer_score = self.dealer.score();
        let order: Vec<String> = self.players.order().to_vec();

        let mut results: Vec<(String, PlayerResult)> = Vec::with_capacity(order.len());
        for nick in &order {
            if let Some(player) = self.players.get_mut(nick) {
                let result = player_result(
                    player.hand.len(),
                    player.score,
                    dealer_score,
                    dealer_blackjack,
                );
                player.result = Some(result);
                results.push((nick.clone(), result));
            }
        }

        self.winner = Some(round_winner(
            results.iter().map(|(nick, result)| (nick.as_str(), *result)),
        ));
        self.status = GameStatus::Finished;
        self.current_player = None;
        self.round.in_progress = false;

        info!(
            lobby_id = %self.lobby_id,
            dealer_score,
            winner = self.winner.as_deref().unwrap_or(""),
            "round finished"
        );
    }
}
