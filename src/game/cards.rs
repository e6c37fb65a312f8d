//! Cards and Deck
//!
//! Card model shared by game logic and the wire protocol. The `hidden`
//! sentinel stands in for the dealer's hole card in any projection that
//! must not disclose it.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

/// Card suit. `Hidden` is the masked-card sentinel, never part of a deck.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Suit {
    Hearts,
    Diamonds,
    Clubs,
    Spades,
    #[serde(rename = "hidden")]
    Hidden,
}

impl Suit {
    /// The four real suits, in deck-building order.
    pub const ALL: [Suit; 4] = [Suit::Hearts, Suit::Diamonds, Suit::Clubs, Suit::Spades];
}

/// Card value as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CardValue {
    #[serde(rename = "2")]
    Two,
    #[serde(rename = "3")]
    Three,
    #[serde(rename = "4")]
    Four,
    #[serde(rename = "5")]
    Five,
    #[serde(rename = "6")]
    Six,
    #[serde(rename = "7")]
    Seven,
    #[serde(rename = "8")]
    Eight,
    #[serde(rename = "9")]
    Nine,
    #[serde(rename = "10")]
    Ten,
    #[serde(rename = "J")]
    Jack,
    #[serde(rename = "Q")]
    Queen,
    #[serde(rename = "K")]
    King,
    #[serde(rename = "A")]
    Ace,
    #[serde(rename = "hidden")]
    Hidden,
}

impl CardValue {
    /// The thirteen real values, in deck-building order.
    pub const ALL: [CardValue; 13] = [
        CardValue::Two,
        CardValue::Three,
        CardValue::Four,
        CardValue::Five,
        CardValue::Six,
        CardValue::Seven,
        CardValue::Eight,
        CardValue::Nine,
        CardValue::Ten,
        CardValue::Jack,
        CardValue::Queen,
        CardValue::King,
        CardValue::Ace,
    ];

    /// Blackjack point value. Aces count 11 here; soft-to-hard reduction
    /// happens in scoring. Hidden cards contribute nothing.
    pub fn points(&self) -> u32 {
        match self {
            CardValue::Two => 2,
            CardValue::Three => 3,
            CardValue::Four => 4,
            CardValue::Five => 5,
            CardValue::Six => 6,
            CardValue::Seven => 7,
            CardValue::Eight => 8,
            CardValue::Nine => 9,
            CardValue::Ten | CardValue::Jack | CardValue::Queen | CardValue::King => 10,
            CardValue::Ace => 11,
            CardValue::Hidden => 0,
        }
    }
}

/// A single playing card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Card {
    /// Card suit.
    pub suit: Suit,
    /// Card value.
    pub value: CardValue,
}

impl Card {
    /// The masked-card sentinel: `{suit: "hidden", value: "hidden"}`.
    pub const HIDDEN: Card = Card {
        suit: Suit::Hidden,
        value: CardValue::Hidden,
    };

    /// Whether this card is the masked sentinel.
    pub fn is_hidden(&self) -> bool {
        self.value == CardValue::Hidden
    }
}

/// Build a freshly shuffled 52-card deck.
///
/// Uniform permutation via Fisher-Yates; cards are drawn from the back
/// with `Vec::pop`.
pub fn build_deck() -> Vec<Card> {
    let mut deck = Vec::with_capacity(52);
    for suit in Suit::ALL {
        for value in CardValue::ALL {
            deck.push(Card { suit, value });
        }
    }
    deck.shuffle(&mut rand::thread_rng());
    deck
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn test_deck_has_52_unique_cards() {
        let deck = build_deck();
        assert_eq!(deck.len(), 52);

        let unique: BTreeSet<String> = deck
            .iter()
            .map(|c| format!("{:?}-{:?}", c.suit, c.value))
            .collect();
        assert_eq!(unique.len(), 52);
        assert!(deck.iter().all(|c| !c.is_hidden()));
    }

    #[test]
    fn test_card_wire_format() {
        let card = Card {
            suit: Suit::Hearts,
            value: CardValue::Ten,
        };
        let json = serde_json::to_string(&card).unwrap();
        assert_eq!(json, r#"{"suit":"Hearts","value":"10"}"#);

        let json = serde_json::to_string(&Card::HIDDEN).unwrap();
        assert_eq!(json, r#"{"suit":"hidden","value":"hidden"}"#);
    }

    #[test]
    fn test_card_roundtrip() {
        for suit in Suit::ALL {
            for value in CardValue::ALL {
                let card = Card { suit, value };
                let json = serde_json::to_string(&card).unwrap();
                let parsed: Card = serde_json::from_str(&json).unwrap();
                assert_eq!(parsed, card);
            }
        }
    }

    #[test]
    fn test_face_card_points() {
        assert_eq!(CardValue::Jack.points(), 10);
        assert_eq!(CardValue::Queen.points(), 10);
        assert_eq!(CardValue::King.points(), 10);
        assert_eq!(CardValue::Ace.points(), 11);
        assert_eq!(CardValue::Hidden.points(), 0);
    }
}
