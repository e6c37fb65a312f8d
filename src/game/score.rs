//! Hand Scoring
//!
//! Blackjack hand totals. Pure function, no state.

use crate::game::cards::{Card, CardValue};

/// Compute the blackjack total of a hand.
///
/// Face cards count 10, numerals their face value, aces 11 softening to 1
/// while the total exceeds 21. Hidden cards are skipped. An empty hand
/// scores 0.
pub fn calculate_score(hand: &[Card]) -> u32 {
    let mut total = 0;
    let mut aces = 0;

    for card in hand {
        if card.is_hidden() {
            continue;
        }
        if card.value == CardValue::Ace {
            aces += 1;
        }
        total += card.value.points();
    }

    while total > 21 && aces > 0 {
        total -= 10;
        aces -= 1;
    }

    total
}

/// Whether a hand is a natural blackjack: exactly two cards totalling 21.
pub fn is_blackjack(hand: &[Card]) -> bool {
    hand.len() == 2 && calculate_score(hand) == 21
}
