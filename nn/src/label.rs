//! Conversion of engine scores and game outcomes into training targets.
//!
//! Labels live in `[-1, 1]` and are always relative to the side to move.
//! Only a forced mate or a decisive game result may produce exactly ±1.0.

use serde::{Deserialize, Serialize};
use shakmaty::{Color, Outcome};

/// Centipawns mapped to tanh(1): 400cp -> ~0.76
pub const SCORE_SCALE: f64 = 400.0;

/// Largest label magnitude a non-mate score can reach (the f32 right below 1.0)
pub const MAX_SCORE_LABEL: f32 = 1.0 - f32::EPSILON / 2.0;

/// Score of a position, given by the engine, relative to the side to move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Score {
    /// Centipawn
    Cp(i32),

    /// Mate/Mated in n (negative when the side to move is getting mated)
    Mate(i32),
}

/// Engine-score policy
pub fn label_from_score(score: Score) -> f32 {
    match score {
        Score::Mate(n) if n > 0 => 1.0,
        // "mate 0" means the side to move is already mated
        Score::Mate(_) => -1.0,
        Score::Cp(cp) => {
            let value = (cp as f64 / SCORE_SCALE).tanh() as f32;
            // large scores would round to exactly ±1.0 in f32
            value.clamp(-MAX_SCORE_LABEL, MAX_SCORE_LABEL)
        }
    }
}

/// Outcome policy
pub fn label_from_outcome(outcome: Outcome, turn: Color) -> f32 {
    match outcome {
        Outcome::Decisive { winner } if winner == turn => 1.0,
        Outcome::Decisive { .. } => -1.0,
        Outcome::Draw => 0.0,
    }
}
