//! Completed and in-progress game records: move history, per-move training
//! annotations, end-of-game results and aggregate win statistics.

use std::fmt::{self, Display};
use std::fs;
use std::io;
use std::path::Path;

use crate::go::{Color, Coord, Position, DEFAULT_KOMI, NUM_MOVES, NUM_POINTS};

#[derive(Clone, Copy, Debug)]
pub struct GameOptions {
    pub komi: f32,
    /// Negative: resign when the side to move's expected value drops below.
    pub resign_threshold: f32,
    pub resign_enabled: bool,
}

impl Default for GameOptions {
    fn default() -> Self {
        GameOptions {
            komi: DEFAULT_KOMI,
            resign_threshold: -0.999,
            resign_enabled: true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GameOverReason {
    Resign,
    Passes,
    MoveLimit,
}

#[derive(Clone, Copy, Debug)]
pub struct GameResult {
    pub winner: Option<Color>,
    /// Final score from black's perspective; zero for resignations.
    pub score: f32,
    pub reason: GameOverReason,
}

impl Display for GameResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.winner, self.reason) {
            (Some(winner), GameOverReason::Resign) => write!(f, "{winner}+R"),
            (Some(winner), _) => write!(f, "{winner}+{}", self.score.abs()),
            (None, _) => write!(f, "0"),
        }
    }
}

pub struct MoveRecord {
    pub color: Color,
    pub coord: Coord,
    /// The position the move was played from.
    pub position: Position,
    /// Model annotation, e.g. "model: <name>". May be empty.
    pub model: String,
    pub q: f32,
    pub search_pi: Box<[f32; NUM_MOVES]>,
    pub trainable: bool,
}

pub struct Game {
    options: GameOptions,
    black_name: String,
    white_name: String,
    moves: Vec<MoveRecord>,
    comments: Vec<String>,
    result: Option<GameResult>,
}

impl Game {
    pub fn new(black_name: String, white_name: String, options: GameOptions) -> Game {
        Game {
            options,
            black_name,
            white_name,
            moves: Vec::new(),
            comments: Vec::new(),
            result: None,
        }
    }

    pub fn options(&self) -> &GameOptions {
        &self.options
    }

    pub fn black_name(&self) -> &str {
        &self.black_name
    }

    pub fn white_name(&self) -> &str {
        &self.white_name
    }

    pub fn moves(&self) -> &[MoveRecord] {
        &self.moves
    }

    pub fn comments(&self) -> &[String] {
        &self.comments
    }

    pub fn result(&self) -> Option<&GameResult> {
        self.result.as_ref()
    }

    pub fn game_over(&self) -> bool {
        self.result.is_some()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_move(
        &mut self,
        color: Color,
        coord: Coord,
        position: Position,
        model: String,
        q: f32,
        search_pi: Box<[f32; NUM_MOVES]>,
    ) {
        assert!(!self.game_over());
        self.moves.push(MoveRecord {
            color,
            coord,
            position,
            model,
            q,
            search_pi,
            trainable: false,
        });
    }

    pub fn mark_last_move_as_trainable(&mut self) {
        self.moves.last_mut().unwrap().trainable = true;
    }

    pub fn add_comment(&mut self, comment: String) {
        self.comments.push(comment);
    }

    pub fn set_game_over_because_of_resign(&mut self, winner: Color) {
        self.result = Some(GameResult {
            winner: Some(winner),
            score: 0.0,
            reason: GameOverReason::Resign,
        });
    }

    pub fn set_game_over_because_of_passes(&mut self, score: f32) {
        self.result = Some(GameResult {
            winner: score_winner(score),
            score,
            reason: GameOverReason::Passes,
        });
    }

    pub fn set_game_over_because_move_limit_reached(&mut self, score: f32) {
        self.result = Some(GameResult {
            winner: score_winner(score),
            score,
            reason: GameOverReason::MoveLimit,
        });
    }

    /// Serializes every trainable move as one little-endian record: the
    /// stone planes of the last `history_len` positions bit-packed as u64
    /// pairs (side to move first), the search policy with illegal moves at
    /// -1, and the game result from the mover's perspective.
    pub fn write_training_examples(&self, history_len: usize, path: &Path) -> io::Result<()> {
        let result = self
            .result
            .expect("training examples require a finished game");

        let mut bytes = Vec::new();
        for (i, record) in self.moves.iter().enumerate() {
            if !record.trainable {
                continue;
            }

            for step in 0..history_len {
                let position = if step <= i {
                    &self.moves[i - step].position
                } else {
                    /* pad early-game history with the empty board */
                    &EMPTY_POSITION
                };
                for color in [record.color, record.color.opposite()] {
                    for word in pack_stones(position, color) {
                        bytes.extend_from_slice(&word.to_le_bytes());
                    }
                }
            }
            bytes.extend_from_slice(&u64::from(record.color == Color::Black).to_le_bytes());

            for idx in 0..NUM_MOVES {
                let c = Coord::from_index(idx);
                let p = if record.position.is_legal(c) {
                    record.search_pi[idx]
                } else {
                    -1.0
                };
                bytes.extend_from_slice(&p.to_le_bytes());
            }

            let outcome: i8 = match result.winner {
                Some(winner) if winner == record.color => 1,
                Some(_) => -1,
                None => 0,
            };
            bytes.extend_from_slice(&outcome.to_le_bytes());
        }

        fs::write(path, bytes)
    }
}

static EMPTY_POSITION: Position = Position::new();

fn score_winner(score: f32) -> Option<Color> {
    if score > 0.0 {
        Some(Color::Black)
    } else if score < 0.0 {
        Some(Color::White)
    } else {
        None
    }
}

/// Packs the stones of one color into ceil(NUM_POINTS / 64) words.
fn pack_stones(position: &Position, color: Color) -> [u64; NUM_POINTS.div_ceil(64)] {
    let mut words = [0u64; NUM_POINTS.div_ceil(64)];
    for idx in 0..NUM_POINTS {
        if position.stone_at(Coord::from_index(idx)) == Some(color) {
            words[idx / 64] |= 1 << (idx % 64);
        }
    }
    words
}

#[derive(Clone, Copy, Default, Debug)]
pub struct ResultCounts {
    pub total: u32,
    pub by_resign: u32,
    pub by_passes: u32,
    pub by_move_limit: u32,
}

impl ResultCounts {
    fn record(&mut self, reason: GameOverReason) {
        self.total += 1;
        match reason {
            GameOverReason::Resign => self.by_resign += 1,
            GameOverReason::Passes => self.by_passes += 1,
            GameOverReason::MoveLimit => self.by_move_limit += 1,
        }
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct WinStats {
    pub black_wins: ResultCounts,
    pub white_wins: ResultCounts,
    pub draws: u32,
}

impl WinStats {
    pub fn update(&mut self, game: &Game) {
        let result = game.result().expect("game must be over");
        match result.winner {
            Some(Color::Black) => self.black_wins.record(result.reason),
            Some(Color::White) => self.white_wins.record(result.reason),
            None => self.draws += 1,
        }
    }

    pub fn format_table(&self, model_name: &str) -> String {
        let total = self.black_wins.total + self.white_wins.total + self.draws;
        format!(
            "{model_name}: {total} games\n  \
             B wins: {} ({} resign, {} passes, {} move limit)\n  \
             W wins: {} ({} resign, {} passes, {} move limit)\n  \
             draws: {}",
            self.black_wins.total,
            self.black_wins.by_resign,
            self.black_wins.by_passes,
            self.black_wins.by_move_limit,
            self.white_wins.total,
            self.white_wins.by_resign,
            self.white_wins.by_passes,
            self.white_wins.by_move_limit,
            self.draws,
        )
    }
}
