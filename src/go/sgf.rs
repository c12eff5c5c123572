//! SGF rendering of finished games. The clean form carries only the moves
//! and result; the full form adds per-move search annotations.

use chrono::Utc;
use itertools::Itertools;

use crate::game::Game;
use crate::go::{Coord, N};

pub fn to_sgf(game: &Game, include_comments: bool) -> String {
    let mut out = String::new();
    out.push_str("(;GM[1]FF[4]CA[UTF-8]RU[Chinese]");
    out.push_str(&format!("SZ[{N}]KM[{}]", game.options().komi));
    out.push_str(&format!(
        "PB[{}]PW[{}]",
        escape(game.black_name()),
        escape(game.white_name())
    ));
    if let Some(result) = game.result() {
        out.push_str(&format!("RE[{result}]"));
    }
    out.push_str(&format!("DT[{}]", Utc::now().format("%Y-%m-%d")));
    if include_comments && !game.comments().is_empty() {
        let joined = game.comments().iter().join("\n");
        out.push_str(&format!("C[{}]", escape(&joined)));
    }

    for record in game.moves() {
        out.push_str(&format!(";{}[{}]", record.color, record.coord.to_sgf()));
        if include_comments {
            let mut comment = String::new();
            if !record.model.is_empty() {
                comment.push_str(&record.model);
            }
            comment.push_str(&format!("Q: {:.5}\n", record.q));
            if record.trainable {
                let top = record
                    .search_pi
                    .iter()
                    .enumerate()
                    .sorted_by(|(_, a), (_, b)| b.total_cmp(a))
                    .take(3)
                    .filter(|(_, &p)| p > 0.0)
                    .map(|(idx, p)| format!("{}: {:.3}", Coord::from_index(idx), p))
                    .join(", ");
                if !top.is_empty() {
                    comment.push_str(&format!("pi: {top}\n"));
                }
            }
            out.push_str(&format!("C[{}]", escape(&comment)));
        }
    }
    out.push(')');
    out
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace(']', "\\]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::game::{Game, GameOptions};
    use crate::go::{Color, Position, NUM_MOVES};

    #[test]
    fn sgf_shape() {
        let mut game = Game::new("model-a".into(), "model-a".into(), GameOptions::default());
        let pos = Position::new();
        game.add_move(
            Color::Black,
            Coord::from_xy(2, 6),
            pos,
            "model: model-a\n".into(),
            0.25,
            Box::new([1.0 / NUM_MOVES as f32; NUM_MOVES]),
        );
        game.mark_last_move_as_trainable();
        let pos = pos.play(Coord::from_xy(2, 6));
        game.add_move(
            Color::White,
            Coord::PASS,
            pos,
            String::new(),
            -0.25,
            Box::new([0.0; NUM_MOVES]),
        );
        game.set_game_over_because_of_passes(4.5);
        game.add_comment("Inferences: [model-a]".into());

        let clean = to_sgf(&game, false);
        assert!(clean.starts_with("(;GM[1]"));
        assert!(clean.contains("RE[B+4.5]"));
        assert!(clean.contains(";B[cg]"));
        assert!(clean.contains(";W[]"));
        assert!(!clean.contains("C["));

        let full = to_sgf(&game, true);
        assert!(full.contains("C[Inferences: [model-a\\]]"));
        assert!(full.contains("Q: 0.25000"));
    }
}
