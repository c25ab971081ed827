// Rebalance Coordinator - gates event partitions on state replay
//
// Every event partition owned by this worker moves through:
// - UNASSIGNED: not owned
// - PAUSED_AWAITING_SYNC: owned and paused, paired state partition replaying
// - ACTIVE: state replayed to its assignment-time end offset, events flowing
//
// Revocation or loss returns a partition to UNASSIGNED from any phase.
//
// The coordinator runs inside the event consumer's poll (rebalance
// callbacks) and talks to the state loop only through StateCommand
// messages. Each assignment gets a fresh epoch so a "synced" message that
// belongs to an earlier ownership of the same partition is ignored.

use crate::cache::PartitionStateCache;
use crate::error::{EngineError, Result};
use crate::listener::{Notification, StateListener};
use crate::state::StateKey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tandem_client::{LogMetadata, PartitionControl, PartitionId, RebalanceListener, TopicPartition};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle phase of one event partition on this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionPhase {
    Unassigned,
    PausedAwaitingSync,
    Active,
}

/// Instruction from the event side to the state loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateCommand {
    /// Start replaying a state partition. `target` is the end offset seen at
    /// assignment, `None` when the lookup failed.
    Assign {
        partition: PartitionId,
        epoch: u64,
        target: Option<u64>,
    },
    /// Stop replaying a state partition
    Revoke { partition: PartitionId },
}

/// Notice from the state loop that a state partition reached its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEvent {
    pub partition: PartitionId,
    pub epoch: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    phase: PartitionPhase,
    epoch: u64,
}

#[derive(Debug, Default)]
struct Phases {
    slots: HashMap<PartitionId, Slot>,
    next_epoch: u64,
}

/// Check that the event and state topics are co-partitioned.
pub fn validate_partition_counts(
    metadata: &dyn LogMetadata,
    event_topic: &str,
    state_topic: &str,
) -> Result<u32> {
    let event_partitions = metadata.partition_count(event_topic)?;
    let state_partitions = metadata.partition_count(state_topic)?;
    if event_partitions != state_partitions {
        return Err(EngineError::PartitionCountMismatch {
            event_topic: event_topic.to_string(),
            event_partitions,
            state_topic: state_topic.to_string(),
            state_partitions,
        });
    }
    Ok(event_partitions)
}

pub struct RebalanceCoordinator<K, S> {
    event_topic: String,
    state_topic: String,
    cache: Arc<PartitionStateCache<K, S>>,
    listener: Arc<dyn StateListener<K, S>>,
    metadata: Arc<dyn LogMetadata>,
    commands: mpsc::UnboundedSender<StateCommand>,
    phases: Mutex<Phases>,
}

impl<K: StateKey, S: Clone + Send + Sync + 'static> RebalanceCoordinator<K, S> {
    pub fn new(
        event_topic: impl Into<String>,
        state_topic: impl Into<String>,
        cache: Arc<PartitionStateCache<K, S>>,
        listener: Arc<dyn StateListener<K, S>>,
        metadata: Arc<dyn LogMetadata>,
        commands: mpsc::UnboundedSender<StateCommand>,
    ) -> Self {
        Self {
            event_topic: event_topic.into(),
            state_topic: state_topic.into(),
            cache,
            listener,
            metadata,
            commands,
            phases: Mutex::new(Phases::default()),
        }
    }

    pub fn phase(&self, partition: PartitionId) -> PartitionPhase {
        self.phases
            .lock()
            .slots
            .get(&partition)
            .map(|slot| slot.phase)
            .unwrap_or(PartitionPhase::Unassigned)
    }

    pub fn is_active(&self, partition: PartitionId) -> bool {
        self.phase(partition) == PartitionPhase::Active
    }

    /// Partitions whose events are being processed, ascending.
    pub fn active_partitions(&self) -> Vec<PartitionId> {
        let mut active: Vec<PartitionId> = self
            .phases
            .lock()
            .slots
            .iter()
            .filter(|(_, slot)| slot.phase == PartitionPhase::Active)
            .map(|(p, _)| *p)
            .collect();
        active.sort_unstable();
        active
    }

    /// Move a partition to ACTIVE if `epoch` is its current assignment.
    ///
    /// Returns true when the caller must resume the event partition.
    pub fn mark_synced(&self, partition: PartitionId, epoch: u64) -> bool {
        let mut phases = self.phases.lock();
        match phases.slots.get_mut(&partition) {
            Some(slot) if slot.epoch == epoch && slot.phase == PartitionPhase::PausedAwaitingSync => {
                slot.phase = PartitionPhase::Active;
                true
            }
            _ => {
                debug!(partition, epoch, "Ignoring sync for a superseded assignment");
                false
            }
        }
    }

    pub fn event_partition(&self, partition: PartitionId) -> TopicPartition {
        TopicPartition::new(self.event_topic.clone(), partition)
    }

    fn assign(&self, partition: PartitionId) {
        let epoch = {
            let mut phases = self.phases.lock();
            phases.next_epoch += 1;
            let epoch = phases.next_epoch;
            phases.slots.insert(
                partition,
                Slot {
                    phase: PartitionPhase::PausedAwaitingSync,
                    epoch,
                },
            );
            epoch
        };
        self.cache.allocate(partition, epoch);

        let state_partition = TopicPartition::new(self.state_topic.clone(), partition);
        let target = match self.metadata.end_offset(&state_partition) {
            Ok(offset) => Some(offset),
            Err(e) => {
                warn!(
                    partition = %state_partition,
                    error = %e,
                    "End offset lookup failed, state loop will resolve it"
                );
                None
            }
        };

        info!(partition, epoch, target = ?target, "Partition assigned, awaiting state sync");
        self.send(StateCommand::Assign {
            partition,
            epoch,
            target,
        });
    }

    fn release(&self, partition: PartitionId, lost: bool) {
        self.phases.lock().slots.remove(&partition);
        let states = self.cache.discard(partition).unwrap_or_default();
        self.send(StateCommand::Revoke { partition });

        if lost {
            warn!(partition, keys = states.len(), "Partition lost");
        } else {
            info!(partition, keys = states.len(), "Partition revoked");
        }
        self.listener
            .on_notification(Notification::PartitionLost { partition, states });
    }

    fn send(&self, command: StateCommand) {
        if self.commands.send(command).is_err() {
            debug!("State loop has stopped, dropping command");
        }
    }

    fn own_partitions(&self, partitions: &[TopicPartition]) -> Vec<PartitionId> {
        partitions
            .iter()
            .filter(|tp| tp.topic == self.event_topic)
            .map(|tp| tp.partition)
            .collect()
    }
}

impl<K: StateKey, S: Clone + Send + Sync + 'static> RebalanceListener for RebalanceCoordinator<K, S> {
    fn on_partitions_assigned(
        &self,
        control: &mut dyn PartitionControl,
        partitions: &[TopicPartition],
    ) {
        // Pause before anything else so no event slips through unsynced.
        if let Err(e) = control.pause(partitions) {
            warn!(partitions = ?partitions, error = %e, "Failed to pause assigned partitions");
        }
        for partition in self.own_partitions(partitions) {
            self.assign(partition);
        }
    }

    fn on_partitions_revoked(
        &self,
        _control: &mut dyn PartitionControl,
        partitions: &[TopicPartition],
    ) {
        for partition in self.own_partitions(partitions) {
            self.release(partition, false);
        }
    }

    fn on_partitions_lost(&self, _control: &mut dyn PartitionControl, partitions: &[TopicPartition]) {
        for partition in self.own_partitions(partitions) {
            self.release(partition, true);
        }
    }
}
