//! Dealer State
//!
//! Owns the dealer's true hand. Everything leaving this module toward a
//! client goes through the hidden/revealed projection: until the dealer
//! acts, the hole card is replaced by the `hidden` sentinel and the score
//! reads 0.

use crate::game::cards::Card;
use crate::game::score::{calculate_score, is_blackjack};

/// The dealer's hand and score.
#[derive(Debug, Default)]
pub struct DealerManager {
    hand: Vec<Card>,
    score: u32,
}

impl DealerManager {
    /// Fresh dealer with an empty hand.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clear the hand for a new round.
    pub fn reset(&mut self) {
        self.hand.clear();
        self.score = 0;
    }

    /// Add a card to the dealer's hand.
    pub fn deal(&mut self, card: Card) {
        self.hand.push(card);
        self.score = calculate_score(&self.hand);
    }

    /// Play the dealer's turn: draw while the score is below 17.
    pub fn play_turn(&mut self, deck: &mut Vec<Card>) {
        while self.score < 17 {
            match deck.pop() {
                Some(card) => {
                    self.hand.push(card);
                    self.score = calculate_score(&self.hand);
                }
                None => break,
            }
        }
    }

    /// The true hand.
    pub fn hand(&self) -> &[Card] {
        &self.hand
    }

    /// The true score.
    pub fn score(&self) -> u32 {
        self.score
    }

    /// The face-up card (first dealt), if any.
    pub fn up_card(&self) -> Option<&Card> {
        self.hand.first()
    }

    /// Whether the dealer holds a natural two-card 21.
    pub fn has_blackjack(&self) -> bool {
        is_blackjack(&self.hand)
    }

    /// Hand as visible to clients: the hole card masked until `reveal`.
    pub fn visible_hand(&self, reveal: bool) -> Vec<Card> {
        if reveal || self.hand.is_empty() {
            return self.hand.clone();
        }
        let mut visible = vec![self.hand[0]];
        visible.extend(std::iter::repeat(Card::HIDDEN).take(self.hand.len() - 1));
        visible
    }

    /// Score as visible to clients: 0 until `reveal`.
    pub fn visible_score(&self, reveal: bool) -> u32 {
        if reveal {
            self.score
        } else {
            0
        }
    }
}
