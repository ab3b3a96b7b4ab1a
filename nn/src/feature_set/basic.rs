use crate::feature_set::FeatureVector;
use shakmaty::{Board, Color, Position, Role, Square};

/// The basic feature set
/// Tuple: <piece_square, piece_role, relative_color>, seen from the side to move
pub struct Basic;

impl Basic {
    /// Encodes the position from the point of view of the side to move
    pub fn encode<P: Position>(position: &P) -> FeatureVector {
        Self::encode_board(position.board(), position.turn())
    }

    /// Encodes a board given the side to move
    pub fn encode_board(board: &Board, turn: Color) -> FeatureVector {
        let mut features = FeatureVector::zeros();

        for (square, piece) in board.clone().into_iter() {
            features.set(Self::make_index(square, piece.role, piece.color, turn));
        }

        features
    }

    pub fn make_index(
        piece_square: Square,
        piece_role: Role,
        piece_color: Color,
        turn: Color,
    ) -> usize {
        let channel = if piece_color == turn {
            match piece_role {
                Role::Pawn => 0,
                Role::Knight => 1,
                Role::Bishop => 2,
                Role::Rook => 3,
                Role::Queen => 4,
                Role::King => 5,
            }
        } else {
            match piece_role {
                Role::Pawn => 6,
                Role::Knight => 7,
                Role::Bishop => 8,
                Role::Rook => 9,
                Role::Queen => 10,
                Role::King => 11,
            }
        };

        let square = if turn == Color::Black {
            // mirror the square if black is to play, so the mover is always on the bottom side
            63 - piece_square as usize
        } else {
            piece_square as usize
        };

        channel * 64 + square
    }
}
