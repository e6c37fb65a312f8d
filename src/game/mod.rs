//! Game Logic Module
//!
//! The blackjack round engine.
//!
//! ## Module Structure
//!
//! - `cards`: Card model, hidden sentinel, deck build + shuffle
//! - `score`: Hand scoring (pure)
//! - `bot`: Bot decision policy (pure)
//! - `winner`: End-of-round outcome rules (pure)
//! - `player`: Per-player state and its sole owner
//! - `dealer`: Dealer hand with hidden/revealed projections
//! - `round`: Dealing, turn machine, readiness loop
//! - `session`: One addressable game per lobby

pub mod bot;
pub mod cards;
pub mod dealer;
pub mod player;
pub mod round;
pub mod score;
pub mod session;
pub mod winner;

// Re-export key types
pub use cards::{build_deck, Card, CardValue, Suit};
pub use player::{PlayerResult, PlayerState, PlayerStatus};
pub use round::PlayerAction;
pub use session::{GameSession, GameStatus, PublicGameState};

/// Errors from guarded game mutations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GameError {
    /// No such player in this game.
    #[error("Player not found: {0}")]
    PlayerNotFound(String),

    /// Acting player is not the current player, or already finished.
    #[error("Not your turn")]
    NotYourTurn,

    /// Action arrived outside the player-turn phase.
    #[error("No round is accepting actions right now")]
    WrongPhase,

    /// Balance cannot cover the double-down stake.
    #[error("Insufficient balance to double down")]
    InsufficientBalance,

    /// Deck ran out of cards.
    #[error("No cards left in deck")]
    EmptyDeck,
}
