//! Board state, move legality, captures and scoring.
//!
//! Positional superko is not tracked; a single-point ko rule plus the move
//! limit is enough to keep self-play games finite.

use std::fmt::{self, Display};

use crate::go::symmetry::{Symmetry, NUM_SYMMETRIES};
use crate::go::{zobrist, Color, Coord, MAX_GAME_MOVES, N, NUM_POINTS};

const EMPTY: u8 = 0;

fn cell(color: Color) -> u8 {
    match color {
        Color::Black => 1,
        Color::White => 2,
    }
}

fn color_idx(color: Color) -> usize {
    match color {
        Color::Black => 0,
        Color::White => 1,
    }
}

fn neighbors(idx: usize) -> impl Iterator<Item = usize> {
    let (x, y) = (idx % N, idx / N);
    [
        (x > 0).then(|| idx - 1),
        (x + 1 < N).then(|| idx + 1),
        (y > 0).then(|| idx - N),
        (y + 1 < N).then(|| idx + N),
    ]
    .into_iter()
    .flatten()
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Position {
    board: [u8; NUM_POINTS],
    to_play: Color,
    stone_hash: u64,
    n: u16,
    consecutive_passes: u8,
    total_passes: u16,
    ko: Option<u16>,
    /// Stones captured by black and by white.
    captures: [u16; 2],
}

impl Default for Position {
    fn default() -> Self {
        Self::new()
    }
}

impl Position {
    pub const fn new() -> Position {
        Position {
            board: [EMPTY; NUM_POINTS],
            to_play: Color::Black,
            stone_hash: 0,
            n: 0,
            consecutive_passes: 0,
            total_passes: 0,
            ko: None,
            captures: [0, 0],
        }
    }

    pub fn to_play(&self) -> Color {
        self.to_play
    }

    /// Number of moves played to reach this position.
    pub fn n(&self) -> usize {
        self.n as usize
    }

    pub fn stone_hash(&self) -> u64 {
        self.stone_hash
    }

    pub fn num_captures(&self) -> [u16; 2] {
        self.captures
    }

    pub fn is_game_over(&self) -> bool {
        self.consecutive_passes >= 2
    }

    pub fn at_move_limit(&self) -> bool {
        self.n as usize >= MAX_GAME_MOVES
    }

    /// The stone hash of the board transformed by `sym`.
    pub fn stone_hash_under(&self, sym: Symmetry) -> u64 {
        let mut hash = 0;
        for (idx, &c) in self.board.iter().enumerate() {
            if c != EMPTY {
                hash ^= zobrist::stone(sym.apply_index(idx), (c - 1) as usize);
            }
        }
        hash
    }

    /// The symmetry mapping this position onto its canonical form, chosen
    /// as the transform with the smallest stone hash.
    pub fn canonical_symmetry(&self) -> Symmetry {
        let mut best = Symmetry::IDENTITY;
        let mut best_hash = self.stone_hash_under(best);
        for idx in 1..NUM_SYMMETRIES {
            let sym = Symmetry::from_index(idx);
            let hash = self.stone_hash_under(sym);
            if hash < best_hash {
                best = sym;
                best_hash = hash;
            }
        }
        best
    }

    pub fn stone_at(&self, c: Coord) -> Option<Color> {
        match self.board[c.index()] {
            EMPTY => None,
            1 => Some(Color::Black),
            _ => Some(Color::White),
        }
    }

    pub fn is_legal(&self, c: Coord) -> bool {
        if c.is_pass() {
            return true;
        }
        let idx = c.index();
        if self.board[idx] != EMPTY || self.ko == Some(idx as u16) {
            return false;
        }
        /* an empty neighbor is a liberty */
        if neighbors(idx).any(|nb| self.board[nb] == EMPTY) {
            return true;
        }
        let own = cell(self.to_play);
        let opp = cell(self.to_play.opposite());
        /* capturing an adjacent opponent chain makes room */
        for nb in neighbors(idx) {
            if self.board[nb] == opp && self.chain_liberties(nb) == 1 {
                return true;
            }
        }
        /* otherwise a friendly chain must keep a liberty besides idx */
        for nb in neighbors(idx) {
            if self.board[nb] == own && self.chain_liberties(nb) > 1 {
                return true;
            }
        }
        false
    }

    /// All legal moves, pass always included last. After five total passes
    /// with `restrict_in_bensons` set, play inside either player's
    /// pass-alive area is excluded.
    pub fn legal_moves(&self, restrict_in_bensons: bool) -> Vec<Coord> {
        let restricted = if restrict_in_bensons && self.total_passes >= 5 {
            Some(self.pass_alive_points())
        } else {
            None
        };
        let mut moves = Vec::new();
        for idx in 0..NUM_POINTS {
            if let Some(mask) = &restricted {
                if mask[idx] {
                    continue;
                }
            }
            let c = Coord::from_index(idx);
            if self.is_legal(c) {
                moves.push(c);
            }
        }
        moves.push(Coord::PASS);
        moves
    }

    pub fn play(&self, c: Coord) -> Position {
        debug_assert!(self.is_legal(c), "illegal move {c}");
        let mut next = *self;
        next.n += 1;
        next.ko = None;
        next.to_play = self.to_play.opposite();
        if c.is_pass() {
            next.consecutive_passes = self.consecutive_passes + 1;
            next.total_passes += 1;
            return next;
        }

        next.consecutive_passes = 0;
        let idx = c.index();
        next.put_stone(idx, self.to_play);

        let opp = cell(self.to_play.opposite());
        let mut num_captured = 0;
        let mut last_captured = 0;
        for nb in neighbors(idx) {
            if next.board[nb] == opp && next.chain_liberties(nb) == 0 {
                let stones = next.chain(nb);
                for &s in &stones {
                    next.remove_stone(s, self.to_play.opposite());
                }
                num_captured += stones.len();
                last_captured = stones[0];
            }
        }
        next.captures[color_idx(self.to_play)] += num_captured as u16;

        /* single-stone capture by a lone stone with one liberty is a ko */
        if num_captured == 1
            && next.chain(idx).len() == 1
            && next.chain_liberties(idx) == 1
        {
            next.ko = Some(last_captured as u16);
        }
        next
    }

    /// Tromp-Taylor area score from black's perspective.
    pub fn score(&self, komi: f32) -> f32 {
        let mut area = [0i32; 2];
        let mut visited = [false; NUM_POINTS];
        for idx in 0..NUM_POINTS {
            match self.board[idx] {
                EMPTY => {
                    if visited[idx] {
                        continue;
                    }
                    /* flood the empty region and record bordering colors */
                    let mut stack = vec![idx];
                    let mut region = Vec::new();
                    let mut borders = [false; 2];
                    visited[idx] = true;
                    while let Some(p) = stack.pop() {
                        region.push(p);
                        for nb in neighbors(p) {
                            match self.board[nb] {
                                EMPTY => {
                                    if !visited[nb] {
                                        visited[nb] = true;
                                        stack.push(nb);
                                    }
                                }
                                c => borders[(c - 1) as usize] = true,
                            }
                        }
                    }
                    match (borders[0], borders[1]) {
                        (true, false) => area[0] += region.len() as i32,
                        (false, true) => area[1] += region.len() as i32,
                        _ => {}
                    }
                }
                c => area[(c - 1) as usize] += 1,
            }
        }
        (area[0] - area[1]) as f32 - komi
    }

    fn put_stone(&mut self, idx: usize, color: Color) {
        self.board[idx] = cell(color);
        self.stone_hash ^= zobrist::stone(idx, color_idx(color));
    }

    fn remove_stone(&mut self, idx: usize, color: Color) {
        self.board[idx] = EMPTY;
        self.stone_hash ^= zobrist::stone(idx, color_idx(color));
    }

    fn chain(&self, start: usize) -> Vec<usize> {
        let target = self.board[start];
        debug_assert!(target != EMPTY);
        let mut visited = [false; NUM_POINTS];
        let mut stack = vec![start];
        let mut stones = Vec::new();
        visited[start] = true;
        while let Some(p) = stack.pop() {
            stones.push(p);
            for nb in neighbors(p) {
                if self.board[nb] == target && !visited[nb] {
                    visited[nb] = true;
                    stack.push(nb);
                }
            }
        }
        stones
    }

    fn chain_liberties(&self, start: usize) -> usize {
        let mut liberties = [false; NUM_POINTS];
        let mut count = 0;
        for p in self.chain(start) {
            for nb in neighbors(p) {
                if self.board[nb] == EMPTY && !liberties[nb] {
                    liberties[nb] = true;
                    count += 1;
                }
            }
        }
        count
    }

    /// Points inside either player's pass-alive area, per Benson's
    /// algorithm: chains that keep two vital regions no matter how the
    /// opponent plays, plus the regions they enclose.
    pub fn pass_alive_points(&self) -> [bool; NUM_POINTS] {
        let mut out = [false; NUM_POINTS];
        self.benson(Color::Black, &mut out);
        self.benson(Color::White, &mut out);
        out
    }

    fn benson(&self, color: Color, out: &mut [bool; NUM_POINTS]) {
        let own = cell(color);

        /* label chains of `color` and regions of everything else */
        let mut chain_id = [usize::MAX; NUM_POINTS];
        let mut chains: Vec<Vec<usize>> = Vec::new();
        let mut region_id = [usize::MAX; NUM_POINTS];
        let mut regions: Vec<Vec<usize>> = Vec::new();
        for idx in 0..NUM_POINTS {
            if self.board[idx] == own {
                if chain_id[idx] == usize::MAX {
                    let id = chains.len();
                    let stones = self.chain(idx);
                    for &s in &stones {
                        chain_id[s] = id;
                    }
                    chains.push(stones);
                }
            } else if region_id[idx] == usize::MAX {
                let id = regions.len();
                let mut stack = vec![idx];
                let mut points = Vec::new();
                region_id[idx] = id;
                while let Some(p) = stack.pop() {
                    points.push(p);
                    for nb in neighbors(p) {
                        if self.board[nb] != own && region_id[nb] == usize::MAX {
                            region_id[nb] = id;
                            stack.push(nb);
                        }
                    }
                }
                regions.push(points);
            }
        }

        /* a region is vital to a chain iff every empty point of the region
         * is a liberty of that chain */
        let mut adjacent: Vec<Vec<usize>> = vec![Vec::new(); regions.len()];
        let mut vital: Vec<Vec<usize>> = vec![Vec::new(); regions.len()];
        for (rid, points) in regions.iter().enumerate() {
            let mut candidates: Option<Vec<usize>> = None;
            for &p in points {
                for nb in neighbors(p) {
                    if self.board[nb] == own && !adjacent[rid].contains(&chain_id[nb]) {
                        adjacent[rid].push(chain_id[nb]);
                    }
                }
                if self.board[p] == EMPTY {
                    let libs: Vec<usize> = neighbors(p)
                        .filter(|&nb| self.board[nb] == own)
                        .map(|nb| chain_id[nb])
                        .collect();
                    candidates = Some(match candidates {
                        None => libs,
                        Some(prev) => prev.into_iter().filter(|c| libs.contains(c)).collect(),
                    });
                }
            }
            /* a region with no empty points is vital to all its neighbors */
            vital[rid] = candidates.unwrap_or_else(|| adjacent[rid].clone());
        }

        let mut chain_alive = vec![true; chains.len()];
        let mut region_alive = vec![true; regions.len()];
        loop {
            let mut changed = false;
            for (cid, alive) in chain_alive.iter_mut().enumerate() {
                if !*alive {
                    continue;
                }
                let vital_count = vital
                    .iter()
                    .enumerate()
                    .filter(|(rid, v)| region_alive[*rid] && v.contains(&cid))
                    .count();
                if vital_count < 2 {
                    *alive = false;
                    changed = true;
                }
            }
            for (rid, alive) in region_alive.iter_mut().enumerate() {
                if *alive && adjacent[rid].iter().any(|&cid| !chain_alive[cid]) {
                    *alive = false;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for (cid, stones) in chains.iter().enumerate() {
            if chain_alive[cid] {
                for &s in stones {
                    out[s] = true;
                }
            }
        }
        for (rid, points) in regions.iter().enumerate() {
            if region_alive[rid] && vital[rid].iter().any(|&cid| chain_alive[cid]) {
                for &p in points {
                    out[p] = true;
                }
            }
        }
    }
}

impl Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for y in 0..N {
            write!(f, "{:>2} ", N - y)?;
            for x in 0..N {
                let ch = match self.board[y * N + x] {
                    EMPTY => '.',
                    1 => 'X',
                    _ => 'O',
                };
                write!(f, "{ch} ")?;
            }
            writeln!(f)?;
        }
        write!(f, "   ")?;
        for x in 0..N {
            write!(f, "{} ", super::COL_NAMES[x] as char)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play_all(moves: &[(usize, usize)]) -> Position {
        let mut pos = Position::new();
        for &(x, y) in moves {
            pos = pos.play(Coord::from_xy(x, y));
        }
        pos
    }

    #[test]
    fn single_stone_capture() {
        /* black surrounds a white stone at (1,1) */
        let mut pos = Position::new();
        for c in [(1, 0), (1, 1), (0, 1), (5, 5), (2, 1), (6, 5)] {
            pos = pos.play(Coord::from_xy(c.0, c.1));
        }
        assert_eq!(pos.stone_at(Coord::from_xy(1, 1)), Some(Color::White));
        pos = pos.play(Coord::from_xy(1, 2));
        assert_eq!(pos.stone_at(Coord::from_xy(1, 1)), None);
        assert_eq!(pos.num_captures(), [1, 0]);
    }

    #[test]
    fn suicide_is_illegal() {
        /* white to play into a black eye at (0,0) */
        let pos = play_all(&[(1, 0), (5, 5), (0, 1), (6, 6)]);
        assert_eq!(pos.to_play(), Color::White);
        assert!(!pos.is_legal(Coord::from_xy(0, 0)));
        /* but black may fill its own eye since the group keeps liberties */
        let pos = pos.play(Coord::PASS);
        assert!(pos.is_legal(Coord::from_xy(0, 0)));
    }

    #[test]
    fn ko_point_is_blocked_for_one_turn() {
        /*
         *  . X O .
         *  X O . O
         *  . X O .
         * black captures at (2,1), white may not recapture at once.
         */
        let pos = play_all(&[
            (1, 0),
            (2, 0),
            (0, 1),
            (3, 1),
            (1, 2),
            (2, 2),
            (8, 8),
            (1, 1),
        ]);
        let pos = pos.play(Coord::from_xy(2, 1));
        assert_eq!(pos.stone_at(Coord::from_xy(1, 1)), None);
        assert!(!pos.is_legal(Coord::from_xy(1, 1)));
        /* after a pass elsewhere the ko lifts */
        let pos = pos.play(Coord::PASS).play(Coord::PASS);
        assert!(pos.is_legal(Coord::from_xy(1, 1)));
    }

    #[test]
    fn two_passes_end_the_game() {
        let pos = Position::new().play(Coord::PASS);
        assert!(!pos.is_game_over());
        let pos = pos.play(Coord::PASS);
        assert!(pos.is_game_over());
    }

    #[test]
    fn empty_board_scores_to_komi() {
        let pos = Position::new();
        assert_eq!(pos.score(7.5), -7.5);
    }

    #[test]
    fn territory_counts_toward_score() {
        /* a lone black stone owns the whole board */
        let pos = Position::new().play(Coord::from_xy(4, 4));
        assert_eq!(pos.score(7.5), NUM_POINTS as f32 - 7.5);
    }

    #[test]
    fn stone_hash_tracks_incrementally() {
        let mut pos = Position::new();
        for c in [(0, 0), (1, 1), (2, 2), (3, 3)] {
            pos = pos.play(Coord::from_xy(c.0, c.1));
            assert_eq!(pos.stone_hash(), pos.stone_hash_under(Symmetry::IDENTITY));
        }
    }

    #[test]
    fn canonical_hash_is_symmetry_invariant() {
        /* the canonical hash of a position equals that of any rotation */
        let pos = play_all(&[(0, 1), (3, 4), (2, 2), (7, 1)]);
        let canonical = pos.stone_hash_under(pos.canonical_symmetry());
        for sym in Symmetry::all() {
            /* rebuild the position transformed by sym */
            let mut rotated = Position::new();
            let mut placements: Vec<(usize, Color)> = Vec::new();
            for idx in 0..NUM_POINTS {
                if let Some(color) = pos.stone_at(Coord::from_index(idx)) {
                    placements.push((sym.apply_index(idx), color));
                }
            }
            for &(idx, color) in &placements {
                rotated.put_stone(idx, color);
            }
            let rotated_canonical = rotated.stone_hash_under(rotated.canonical_symmetry());
            assert_eq!(canonical, rotated_canonical);
        }
    }

    #[test]
    fn corner_eyes_are_pass_alive() {
        /* two-eye corner group:
         *  . X . . .
         *  X X . . .
         * eyes at (0,0) and (2,0)?  Build a solid pass-alive shape instead:
         * black wall on row 1 with eyes at (0,0) and (2,0).
         */
        let mut pos = Position::new();
        for (x, y) in [(1, 0), (0, 1), (1, 1), (2, 1), (3, 1), (3, 0)] {
            pos.put_stone(Coord::from_xy(x, y).index(), Color::Black);
        }
        let mask = pos.pass_alive_points();
        assert!(mask[Coord::from_xy(0, 0).index()]);
        assert!(mask[Coord::from_xy(2, 0).index()]);
        assert!(mask[Coord::from_xy(1, 1).index()]);
        /* the open board is not pass-alive */
        assert!(!mask[Coord::from_xy(5, 5).index()]);
    }
}
