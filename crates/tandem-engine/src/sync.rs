//! Tracks how far each newly assigned state partition must be replayed.

use std::collections::HashMap;
use tandem_client::PartitionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SyncTarget {
    offset: u64,
    epoch: u64,
}

/// Per-partition replay targets, owned by the state loop.
#[derive(Debug, Default)]
pub struct PartitionSyncTracker {
    targets: HashMap<PartitionId, SyncTarget>,
}

impl PartitionSyncTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the state-log offset `partition` must reach for assignment
    /// `epoch`. Re-seeding replaces any earlier target.
    pub fn seed(&mut self, partition: PartitionId, target: u64, epoch: u64) {
        self.targets.insert(
            partition,
            SyncTarget {
                offset: target,
                epoch,
            },
        );
    }

    /// Returns true exactly once, when `position` first reaches the target.
    /// The partition stops being tracked at that point.
    pub fn advance(&mut self, partition: PartitionId, position: u64) -> bool {
        let reached = self
            .targets
            .get(&partition)
            .is_some_and(|target| position >= target.offset);
        if reached {
            self.targets.remove(&partition);
        }
        reached
    }

    pub fn is_pending(&self, partition: PartitionId) -> bool {
        self.targets.contains_key(&partition)
    }

    /// Assignment epoch the pending target was seeded for.
    pub fn epoch(&self, partition: PartitionId) -> Option<u64> {
        self.targets.get(&partition).map(|t| t.epoch)
    }

    pub fn target(&self, partition: PartitionId) -> Option<u64> {
        self.targets.get(&partition).map(|t| t.offset)
    }

    pub fn remove(&mut self, partition: PartitionId) -> bool {
        self.targets.remove(&partition).is_some()
    }

    /// Pending partitions in ascending order.
    pub fn pending(&self) -> Vec<PartitionId> {
        let mut pending: Vec<PartitionId> = self.targets.keys().copied().collect();
        pending.sort_unstable();
        pending
    }
}
