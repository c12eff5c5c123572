//! Fan-out of CPU-bound work over a fixed shard count.
//!
//! Concurrent `execute` calls are serialized by a mutex when there is more
//! than one shard. That mutex is load-bearing: while one self-play thread
//! holds the executor for tree search, another can occupy the accelerator,
//! and they alternate.

use std::ops::Range;
use std::sync::Mutex;
use std::thread;

pub struct ShardedExecutor {
    num_shards: usize,
    serial: Mutex<()>,
}

impl ShardedExecutor {
    pub fn new(num_shards: usize) -> ShardedExecutor {
        assert!(num_shards >= 1);
        ShardedExecutor {
            num_shards,
            serial: Mutex::new(()),
        }
    }

    pub fn num_shards(&self) -> usize {
        self.num_shards
    }

    /// Runs `f(shard_index, num_shards)` once per shard and returns after
    /// every shard completes. Single-shard executors run inline on the
    /// caller with no locking.
    pub fn execute(&self, f: impl Fn(usize, usize) + Send + Sync) {
        if self.num_shards == 1 {
            f(0, 1);
            return;
        }
        let _serial = self.serial.lock().unwrap();
        thread::scope(|scope| {
            for i in 1..self.num_shards {
                let f = &f;
                scope.spawn(move || f(i, self.num_shards));
            }
            f(0, self.num_shards);
        });
    }
}

/// Splits `len` items over `num_shards` as evenly as possible; remainder
/// items go to the lowest-indexed shards.
pub fn shard_range(shard: usize, num_shards: usize, len: usize) -> Range<usize> {
    let base = len / num_shards;
    let rem = len % num_shards;
    let begin = shard * base + shard.min(rem);
    let end = begin + base + usize::from(shard < rem);
    begin..end
}
