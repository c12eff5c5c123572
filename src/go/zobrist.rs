//! Process-wide Zobrist table for incremental stone hashing.

use std::sync::OnceLock;

use crate::go::NUM_POINTS;

pub struct ZobristTable {
    /// One value per point and stone color.
    stones: [[u64; 2]; NUM_POINTS],
}

static TABLE: OnceLock<ZobristTable> = OnceLock::new();

/// splitmix64 finalizer, also used to derive per-leaf inference symmetries.
pub fn mix_bits(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

fn build(seed: u64) -> ZobristTable {
    let mut state = mix_bits(seed ^ 0xc0ffee);
    let mut stones = [[0u64; 2]; NUM_POINTS];
    for point in stones.iter_mut() {
        for v in point.iter_mut() {
            state = mix_bits(state);
            *v = state;
        }
    }
    ZobristTable { stones }
}

/// Initializes the table from a seed. Idempotent: the first call wins,
/// which keeps the table stable across tests sharing a process.
pub fn init(seed: u64) {
    TABLE.get_or_init(|| build(seed));
}

pub fn stone(idx: usize, color_idx: usize) -> u64 {
    TABLE.get_or_init(|| build(0)).stones[idx][color_idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_are_distinct() {
        init(7);
        let mut seen = std::collections::HashSet::new();
        for idx in 0..NUM_POINTS {
            for color in 0..2 {
                assert!(seen.insert(stone(idx, color)));
            }
        }
    }
}
