use std::collections::hash_map::RandomState;
use std::hash::Hash;

use dashmap::DashMap;

const MAX_SHARD_AMOUNT: usize = 1 << 16;

/// Options sizes the default registry of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Capacity is the number of keys the registry holds without reallocating. default is 0
    pub capacity: usize,
    /// ShardAmount is the number of independently locked shards. default is None
    /// which keeps the dashmap default (scaled to the number of cpus).
    /// Clamped to 2..=65536 and rounded up to a power of two.
    pub shard_amount: Option<usize>,
}

impl Options {
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn shard_amount(mut self, shard_amount: usize) -> Self {
        self.shard_amount = Some(shard_amount);
        self
    }

    pub(crate) fn build<K, V>(&self) -> DashMap<K, V>
    where
        K: Eq + Hash,
    {
        match self.shard_amount {
            Some(n) => DashMap::with_capacity_and_hasher_and_shard_amount(
                self.capacity,
                RandomState::new(),
                n.clamp(2, MAX_SHARD_AMOUNT).next_power_of_two(),
            ),
            None => DashMap::with_capacity(self.capacity),
        }
    }
}
