//! Symmetry-aware inference cache.
//!
//! Keys canonicalize positions over the eight board symmetries, so
//! transpositions reached in any orientation share one entry. Stored
//! outputs live in the canonical orientation; `try_get` and `merge` are the
//! only places that compose symmetries, callers never rotate.

use std::collections::{HashMap, VecDeque};
use std::fmt::{self, Display};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::go::symmetry::Symmetry;
use crate::go::zobrist::mix_bits;
use crate::go::{Color, Coord, Position};
use crate::model::ModelOutput;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct CacheKey {
    stone_hash: u64,
    prev_move: Coord,
    to_play: Color,
}

impl CacheKey {
    pub fn new(prev_move: Coord, canonical_sym: Symmetry, position: &Position) -> CacheKey {
        CacheKey {
            stone_hash: position.stone_hash_under(canonical_sym),
            prev_move: canonical_sym.apply_coord(prev_move),
            to_play: position.to_play(),
        }
    }

    fn shard(&self, num_shards: usize) -> usize {
        (mix_bits(self.stone_hash ^ self.prev_move.index() as u64) % num_shards as u64) as usize
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub size: usize,
}

impl Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "hits: {}  misses: {}  evictions: {}  size: {}",
            self.hits, self.misses, self.evictions, self.size
        )
    }
}

pub trait InferenceCache: Send + Sync {
    /// Looks the key up, returning the stored output rotated from the
    /// canonical orientation into `requested_sym`.
    fn try_get(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        requested_sym: Symmetry,
    ) -> Option<ModelOutput>;

    /// Rotates `output` back into the canonical orientation and stores it.
    fn merge(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        requested_sym: Symmetry,
        output: &ModelOutput,
    );

    fn stats(&self) -> CacheStats;
}

/// Capacity-zero variant: every lookup misses, every merge is dropped.
pub struct NullCache;

impl InferenceCache for NullCache {
    fn try_get(&self, _: CacheKey, _: Symmetry, _: Symmetry) -> Option<ModelOutput> {
        None
    }

    fn merge(&self, _: CacheKey, _: Symmetry, _: Symmetry, _: &ModelOutput) {}

    fn stats(&self) -> CacheStats {
        CacheStats::default()
    }
}

struct Shard {
    map: HashMap<CacheKey, ModelOutput>,
    /* insertion order; oldest entries are evicted first */
    order: VecDeque<CacheKey>,
}

pub struct ShardedCache {
    shards: Vec<Mutex<Shard>>,
    shard_capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    hits_metric: metrics::Counter,
    misses_metric: metrics::Counter,
}

/// Approximate per-entry footprint used to derive capacity from a megabyte
/// budget: key + output + map and deque overhead.
const ENTRY_SIZE: usize =
    std::mem::size_of::<CacheKey>() * 2 + std::mem::size_of::<ModelOutput>() + 64;

impl ShardedCache {
    pub fn calculate_capacity(size_mb: usize) -> usize {
        (size_mb << 20) / ENTRY_SIZE
    }

    pub fn new(capacity: usize, num_shards: usize) -> ShardedCache {
        assert!(capacity > 0 && num_shards > 0);
        let shard_capacity = capacity.div_ceil(num_shards);
        let shards = (0..num_shards)
            .map(|_| {
                Mutex::new(Shard {
                    map: HashMap::with_capacity(shard_capacity),
                    order: VecDeque::with_capacity(shard_capacity),
                })
            })
            .collect();
        ShardedCache {
            shards,
            shard_capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            hits_metric: metrics::counter!("inference_cache.hits"),
            misses_metric: metrics::counter!("inference_cache.misses"),
        }
    }
}

impl InferenceCache for ShardedCache {
    fn try_get(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        requested_sym: Symmetry,
    ) -> Option<ModelOutput> {
        let shard = self.shards[key.shard(self.shards.len())].lock().unwrap();
        match shard.map.get(&key) {
            Some(stored) => {
                let sym = Symmetry::concat(canonical_sym.inverse(), requested_sym);
                let output = ModelOutput {
                    policy: sym.apply_policy(&stored.policy),
                    value: stored.value,
                };
                drop(shard);
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.hits_metric.increment(1);
                Some(output)
            }
            None => {
                drop(shard);
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.misses_metric.increment(1);
                None
            }
        }
    }

    fn merge(
        &self,
        key: CacheKey,
        canonical_sym: Symmetry,
        requested_sym: Symmetry,
        output: &ModelOutput,
    ) {
        let sym = Symmetry::concat(requested_sym.inverse(), canonical_sym);
        let canonical = ModelOutput {
            policy: sym.apply_policy(&output.policy),
            value: output.value,
        };
        let mut evicted = 0;
        {
            let mut shard = self.shards[key.shard(self.shards.len())].lock().unwrap();
            if shard.map.insert(key, canonical).is_none() {
                shard.order.push_back(key);
                while shard.order.len() > self.shard_capacity {
                    let oldest = shard.order.pop_front().unwrap();
                    shard.map.remove(&oldest);
                    evicted += 1;
                }
            }
        }
        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
        }
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: self
                .shards
                .iter()
                .map(|s| s.lock().unwrap().map.len())
                .sum(),
        }
    }
}
