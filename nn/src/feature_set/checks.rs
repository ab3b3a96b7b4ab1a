use super::basic::Basic;
use super::NUM_FEATURES;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use shakmaty::{fen::Fen, Chess, Color, Position};

pub(super) fn sanity_checks() {
    const FENS: [&str; 4] = [
        "4nrk1/3q1pp1/2n1p1p1/8/1P2Q3/7P/PB1N1PP1/2R3K1 w - - 5 26",
        "5r2/1p2ppkp/p2p1nP1/qn6/4P3/2r2B2/1PPQ1PP1/2KR3R w - - 0 21",
        "r1bqkb1r/pppp1ppp/2n2n2/4p3/2B1P3/5N2/PPPP1PPP/RNBQK2R b KQkq - 4 4",
        "8/8/1q4b1/8/8/4k3/K7/8 b - - 19 68",
    ];

    for fen in FENS {
        let fen: Fen = fen.parse().unwrap();
        let pos: Chess = fen.into_position(shakmaty::CastlingMode::Standard).unwrap();

        check_piece_count(&pos);
        check_mirrored(&pos);
    }

    // positions reached by random playouts, both sides to move
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    for _ in 0..20 {
        let mut pos = Chess::default();
        for _ in 0..60 {
            let moves = pos.legal_moves();
            let Some(m) = moves.choose(&mut rng) else {
                break;
            };
            pos.play_unchecked(m);

            check_piece_count(&pos);
            check_mirrored(&pos);
        }
    }
}

/// Exactly one active entry per occupied square, all of them equal to 1.0
fn check_piece_count(pos: &Chess) {
    let features = Basic::encode(pos);
    let dense = features.to_dense();

    assert_eq!(dense.len(), NUM_FEATURES);
    assert_eq!(features.count_active(), pos.board().occupied().count());
    assert!(dense.iter().all(|&x| x == 0.0 || x == 1.0));
    assert_eq!(
        dense.iter().filter(|&&x| x == 1.0).count(),
        pos.board().occupied().count()
    );
}

/// The color-reversed mirror (board rotated 180 degrees, colors swapped,
/// other side to move) must produce exactly the same encoding
fn check_mirrored(pos: &Chess) {
    let turn = pos.turn();

    let mut mirrored = pos.board().clone();
    mirrored.flip_vertical();
    mirrored.flip_horizontal();
    mirrored.swap_colors();

    let orig = Basic::encode_board(pos.board(), turn);
    let flip = Basic::encode_board(&mirrored, turn.other());

    assert_eq!(orig, flip);

    // white to move is never mirrored
    if turn == Color::White {
        for (square, piece) in pos.board().clone().into_iter() {
            let index = Basic::make_index(square, piece.role, piece.color, turn);
            assert_eq!(index % 64, square as usize);
        }
    }
}
