#![forbid(unsafe_code)]

use parking_lot::{Mutex, MutexGuard};

use crate::types::Goff;

/// Default number of shard locks; prime to spread goffs evenly.
pub const DEFAULT_SHARD_COUNT: usize = 197;

/// Fixed array of mutexes guarding weight mutation, indexed by `goff % N`.
///
/// Callers that need several shards must go through [`ShardLocks::lock_set`],
/// which always acquires in ascending shard order so that two multi-shard
/// operations can never deadlock against each other.
pub struct ShardLocks {
    shards: Box<[Mutex<()>]>,
}

/// Guard holding one shard lock.
pub struct ShardGuard<'a> {
    shard: usize,
    _guard: MutexGuard<'a, ()>,
}

impl ShardGuard<'_> {
    /// Index of the held shard.
    pub fn shard(&self) -> usize {
        self.shard
    }
}

/// Guard holding a set of shard locks, released together on drop.
pub struct ShardSetGuard<'a> {
    guards: Vec<ShardGuard<'a>>,
}

impl ShardSetGuard<'_> {
    /// Shard indexes held, in acquisition order.
    pub fn shards(&self) -> Vec<usize> {
        self.guards.iter().map(ShardGuard::shard).collect()
    }
}

impl ShardLocks {
    /// Creates `count` shard locks; zero is bumped to one.
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let shards = (0..count).map(|_| Mutex::new(())).collect::<Vec<_>>();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Number of shards.
    pub fn len(&self) -> usize {
        self.shards.len()
    }

    /// Always false; at least one shard exists.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Shard index guarding `goff`.
    pub fn shard_of(&self, goff: Goff) -> usize {
        (goff.0 % self.shards.len() as u64) as usize
    }

    /// Locks the shard guarding `goff`.
    pub fn lock(&self, goff: Goff) -> ShardGuard<'_> {
        let shard = self.shard_of(goff);
        ShardGuard {
            shard,
            _guard: self.shards[shard].lock(),
        }
    }

    /// Locks every shard touched by `goffs`, each once, in ascending order.
    pub fn lock_set(&self, goffs: &[Goff]) -> ShardSetGuard<'_> {
        let mut shards: Vec<usize> = goffs.iter().map(|goff| self.shard_of(*goff)).collect();
        shards.sort_unstable();
        shards.dedup();
        let guards = shards
            .into_iter()
            .map(|shard| ShardGuard {
                shard,
                _guard: self.shards[shard].lock(),
            })
            .collect();
        ShardSetGuard { guards }
    }
}

impl Default for ShardLocks {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}
