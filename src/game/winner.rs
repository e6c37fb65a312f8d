//! Winner Determination
//!
//! Pure end-of-round outcome rules. Bust loses regardless of the dealer;
//! a natural blackjack beats everything except a dealer natural.

use crate::game::player::PlayerResult;

/// Outcome for a single player against the dealer's final score.
///
/// `dealer_blackjack` is true only when the dealer held a two-card 21 at
/// the deal, which ends the round before anyone acts.
pub fn player_result(
    hand_len: usize,
    score: u32,
    dealer_score: u32,
    dealer_blackjack: bool,
) -> PlayerResult {
    if hand_len == 2 && score == 21 {
        return if dealer_blackjack {
            PlayerResult::Push
        } else {
            PlayerResult::Blackjack
        };
    }
    if dealer_blackjack || score > 21 {
        return PlayerResult::Lose;
    }
    if dealer_score > 21 || score > dealer_score {
        return PlayerResult::Win;
    }
    if score < dealer_score {
        return PlayerResult::Lose;
    }
    PlayerResult::Push
}

/// Pick the round's headline winner: the first player in seat order whose
/// result is a win or a blackjack, else the literal `"push"`.
pub fn round_winner<'a, I>(results: I) -> String
where
    I: IntoIterator<Item = (&'a str, PlayerResult)>,
{
    for (nick, result) in results {
        if matches!(result, PlayerResult::Win | PlayerResult::Blackjack) {
            return nick.to_string();
        }
    }
    "push".to_string()
}
