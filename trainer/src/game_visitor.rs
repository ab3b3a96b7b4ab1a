use pgn_reader::{RawHeader, SanPlus, Skip, Visitor};
use shakmaty::{Chess, Color, Outcome, Position};

/// Mainline of a game, replayed from the starting position
#[derive(Debug, Clone)]
pub struct RecordedGame {
    /// Position after each mainline move, in game order
    pub positions: Vec<Chess>,

    /// Result from the movetext, or from the `Result` header if the movetext has none
    pub outcome: Option<Outcome>,
}

impl RecordedGame {
    /// Positions after a move that leave at least one legal reply
    pub fn candidates(&self) -> impl Iterator<Item = &Chess> {
        self.positions.iter().filter(|pos| !pos.legal_moves().is_empty())
    }
}

/// A game whose movetext could not be replayed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedGame {
    pub reason: String,
}

#[derive(Default)]
pub struct GameVisitor {
    /// All positions for the current game, the starting position is not included
    positions: Vec<Chess>,

    header_outcome: Option<Outcome>,
    movetext_outcome: Option<Outcome>,

    /// First replay error of the current game
    error: Option<String>,
}

impl GameVisitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Chess {
        self.positions.last().cloned().unwrap_or_default()
    }
}

fn parse_result(value: &str) -> Option<Outcome> {
    match value.trim() {
        "1-0" => Some(Outcome::Decisive { winner: Color::White }),
        "0-1" => Some(Outcome::Decisive { winner: Color::Black }),
        "1/2-1/2" => Some(Outcome::Draw),
        _ => None,
    }
}

impl Visitor for GameVisitor {
    type Result = Result<RecordedGame, MalformedGame>;

    fn begin_game(&mut self) {
        self.positions.clear();
        self.header_outcome = None;
        self.movetext_outcome = None;
        self.error = None;
    }

    fn header(&mut self, key: &[u8], value: RawHeader<'_>) {
        if key == b"Result" {
            self.header_outcome = parse_result(&String::from_utf8_lossy(value.as_bytes()));
        } else if key == b"FEN" || key == b"SetUp" && value.as_bytes() == b"1" {
            // only games from the standard starting position are replayed
            self.error =
                Some("games from a custom starting position are not supported".to_string());
        }
    }

    fn end_headers(&mut self) -> Skip {
        Skip(self.error.is_some())
    }

    fn begin_variation(&mut self) -> Skip {
        Skip(true) // stay in the mainline
    }

    fn san(&mut self, san_plus: SanPlus) {
        if self.error.is_some() {
            return;
        }

        let pos = self.current();
        match san_plus.san.to_move(&pos) {
            Ok(m) => {
                let mut next = pos;
                next.play_unchecked(&m);
                self.positions.push(next);
            }
            Err(_) => {
                self.error = Some(format!(
                    "illegal move {} after {} plies",
                    san_plus,
                    self.positions.len()
                ));
            }
        }
    }

    fn outcome(&mut self, outcome: Option<Outcome>) {
        self.movetext_outcome = outcome;
    }

    fn end_game(&mut self) -> Self::Result {
        if let Some(reason) = self.error.take() {
            return Err(MalformedGame { reason });
        }

        Ok(RecordedGame {
            positions: std::mem::take(&mut self.positions),
            outcome: self.movetext_outcome.or(self.header_outcome),
        })
    }
}
