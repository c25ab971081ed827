//! Partition-sharded state cache.
//!
//! Each owned partition has its own key map behind one [`DashMap`] entry, so
//! merges into different partitions never contend and a revoke is a single
//! atomic removal. Merges follow last-write-wins on record timestamps:
//! an incoming entry replaces the stored one when its timestamp is greater or
//! equal. Tombstones stay stored (so an older replayed value cannot resurrect
//! the key) but are never visible.
//!
//! Every shard remembers the assignment epoch it was allocated for, so a
//! replay that finishes for an earlier ownership cannot announce the
//! content of a later one.

use crate::state::{StateEntry, StateKey, StateValue};
use dashmap::DashMap;
use std::collections::HashMap;
use tandem_client::PartitionId;

/// Result of a [`PartitionStateCache::merge`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The entry replaced the stored one (or was the first for its key)
    Applied,
    /// A newer entry is already stored
    Stale,
    /// The partition is not owned by this worker
    NotOwned,
}

pub struct PartitionStateCache<K, S> {
    partitions: DashMap<PartitionId, Shard<K, S>>,
}

struct Shard<K, S> {
    epoch: u64,
    states: HashMap<K, StateEntry<S>>,
}

impl<K: StateKey, S: Clone> PartitionStateCache<K, S> {
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
        }
    }

    /// Create the empty map for a partition assigned under `epoch`.
    ///
    /// Allocating an owned partition keeps its entries and takes the new
    /// epoch.
    pub fn allocate(&self, partition: PartitionId, epoch: u64) {
        self.partitions
            .entry(partition)
            .and_modify(|shard| shard.epoch = epoch)
            .or_insert_with(|| Shard {
                epoch,
                states: HashMap::new(),
            });
    }

    /// Epoch the partition was allocated under, `None` when not owned.
    pub fn epoch(&self, partition: PartitionId) -> Option<u64> {
        self.partitions.get(&partition).map(|shard| shard.epoch)
    }

    pub fn is_owned(&self, partition: PartitionId) -> bool {
        self.partitions.contains_key(&partition)
    }

    /// Apply one state record under last-write-wins.
    pub fn merge(
        &self,
        partition: PartitionId,
        key: K,
        timestamp: i64,
        value: StateValue<S>,
    ) -> MergeOutcome {
        let Some(mut shard) = self.partitions.get_mut(&partition) else {
            return MergeOutcome::NotOwned;
        };
        if let Some(stored) = shard.states.get(&key) {
            if timestamp < stored.timestamp {
                return MergeOutcome::Stale;
            }
        }
        shard.states.insert(key, StateEntry::new(timestamp, value));
        MergeOutcome::Applied
    }

    /// Visible value of `key` in the first owned partition that has one.
    ///
    /// Linear in the number of owned partitions and assumes a key lives in
    /// one partition only. Use [`get_in`](Self::get_in) when the partition
    /// is known.
    pub fn get(&self, key: &K) -> Option<S> {
        self.partitions.iter().find_map(|shard| {
            shard
                .states
                .get(key)
                .and_then(|entry| entry.value.as_present().cloned())
        })
    }

    /// Stored entry of `key` in one partition, tombstones included.
    pub fn get_in(&self, partition: PartitionId, key: &K) -> Option<StateEntry<S>> {
        self.partitions
            .get(&partition)
            .and_then(|shard| shard.states.get(key).cloned())
    }

    /// Visible values of one partition, `None` when it is not owned.
    pub fn snapshot(&self, partition: PartitionId) -> Option<HashMap<K, S>> {
        self.partitions
            .get(&partition)
            .map(|shard| Self::visible(&shard.states))
    }

    /// Like [`snapshot`](Self::snapshot), but `None` unless the partition is
    /// still owned under `epoch`.
    pub fn snapshot_at(&self, partition: PartitionId, epoch: u64) -> Option<HashMap<K, S>> {
        self.partitions
            .get(&partition)
            .filter(|shard| shard.epoch == epoch)
            .map(|shard| Self::visible(&shard.states))
    }

    /// Remove a partition and return its final visible values.
    pub fn discard(&self, partition: PartitionId) -> Option<HashMap<K, S>> {
        self.partitions
            .remove(&partition)
            .map(|(_, shard)| Self::visible(&shard.states))
    }

    /// Overwrite entries with values that were durably committed, skipping the
    /// timestamp check. Returns the applied key/value delta; entries for a
    /// partition that is not owned are dropped.
    pub fn apply_committed(
        &self,
        partition: PartitionId,
        updates: impl IntoIterator<Item = (K, StateEntry<S>)>,
    ) -> HashMap<K, StateValue<S>> {
        let mut delta = HashMap::new();
        let Some(mut shard) = self.partitions.get_mut(&partition) else {
            return delta;
        };
        for (key, entry) in updates {
            delta.insert(key.clone(), entry.value.clone());
            shard.states.insert(key, entry);
        }
        delta
    }

    /// Owned partitions in ascending order.
    pub fn partitions(&self) -> Vec<PartitionId> {
        let mut partitions: Vec<PartitionId> = self.partitions.iter().map(|e| *e.key()).collect();
        partitions.sort_unstable();
        partitions
    }

    fn visible(states: &HashMap<K, StateEntry<S>>) -> HashMap<K, S> {
        states
            .iter()
            .filter_map(|(key, entry)| entry.value.as_present().map(|s| (key.clone(), s.clone())))
            .collect()
    }
}

impl<K: StateKey, S: Clone> Default for PartitionStateCache<K, S> {
    fn default() -> Self {
        Self::new()
    }
}
