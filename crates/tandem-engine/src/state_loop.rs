//! Replays the compacted state log into the cache.
//!
//! The state loop owns the state consumer and the [`PartitionSyncTracker`].
//! It follows the event side's assignment through [`StateCommand`]s, merges
//! every polled state record, and reports partitions whose replay reached
//! the assignment-time end offset with a [`SyncEvent`].

use crate::cache::{MergeOutcome, PartitionStateCache};
use crate::codec;
use crate::coordinator::{StateCommand, SyncEvent};
use crate::error::Result;
use crate::listener::{Notification, StateListener};
use crate::state::{StateData, StateKey};
use crate::sync::PartitionSyncTracker;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ConsumerClient, LogMetadata, PartitionId, Record, TopicPartition};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub(crate) struct StateLoop<K, S> {
    client: ConsumerClient,
    state_topic: String,
    tracker: PartitionSyncTracker,
    cache: Arc<PartitionStateCache<K, S>>,
    listener: Arc<dyn StateListener<K, S>>,
    metadata: Arc<dyn LogMetadata>,
    commands: mpsc::UnboundedReceiver<StateCommand>,
    synced: mpsc::UnboundedSender<SyncEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    poll_timeout: Duration,
    /// Assigned partitions whose end offset is still unknown, by epoch
    unresolved: HashMap<PartitionId, u64>,
}

impl<K: StateKey, S: StateData> StateLoop<K, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: ConsumerClient,
        state_topic: impl Into<String>,
        cache: Arc<PartitionStateCache<K, S>>,
        listener: Arc<dyn StateListener<K, S>>,
        metadata: Arc<dyn LogMetadata>,
        commands: mpsc::UnboundedReceiver<StateCommand>,
        synced: mpsc::UnboundedSender<SyncEvent>,
        shutdown: Arc<watch::Sender<bool>>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            state_topic: state_topic.into(),
            tracker: PartitionSyncTracker::new(),
            cache,
            listener,
            metadata,
            commands,
            synced,
            shutdown,
            poll_timeout,
            unresolved: HashMap::new(),
        }
    }

    /// Run until shutdown or a fatal error, then stop the event loop too and
    /// close the state consumer.
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(topic = %self.state_topic, "State loop started");
        let mut result = Ok(());
        while !*self.shutdown.borrow() {
            if let Err(e) = self.run_once().await {
                error!(topic = %self.state_topic, error = %e, "State loop failed");
                result = Err(e);
                break;
            }
        }

        self.shutdown.send_replace(true);
        self.client.close().await;
        info!(topic = %self.state_topic, "State loop stopped");
        result
    }

    /// One iteration: apply commands, poll, merge, report synced partitions.
    pub(crate) async fn run_once(&mut self) -> Result<()> {
        self.apply_commands()?;
        self.resolve_targets();

        let records = self.client.poll(self.poll_timeout).await?;
        for record in &records {
            self.merge(record);
        }
        // Ownership may have changed on the event side while polling.
        self.apply_commands()?;
        self.report_synced();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn tracker(&self) -> &PartitionSyncTracker {
        &self.tracker
    }

    fn apply_commands(&mut self) -> Result<()> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                StateCommand::Assign {
                    partition,
                    epoch,
                    target,
                } => {
                    let tp = self.partition(partition);
                    if !self.client.assignment().contains(&tp) {
                        self.client.assign(std::slice::from_ref(&tp))?;
                    }
                    self.client.seek_to_beginning(std::slice::from_ref(&tp))?;
                    match target {
                        Some(offset) => {
                            self.unresolved.remove(&partition);
                            self.tracker.seed(partition, offset, epoch);
                        }
                        None => {
                            self.tracker.remove(partition);
                            self.unresolved.insert(partition, epoch);
                        }
                    }
                    debug!(partition, epoch, target = ?target, "Replaying state partition");
                }
                StateCommand::Revoke { partition } => {
                    self.tracker.remove(partition);
                    self.unresolved.remove(&partition);
                    let tp = self.partition(partition);
                    if self.client.assignment().contains(&tp) {
                        self.client.unassign(std::slice::from_ref(&tp))?;
                    }
                    debug!(partition, "Stopped replaying state partition");
                }
            }
        }
        Ok(())
    }

    fn resolve_targets(&mut self) {
        if self.unresolved.is_empty() {
            return;
        }
        let pending: Vec<(PartitionId, u64)> = self.unresolved.iter().map(|(p, e)| (*p, *e)).collect();
        for (partition, epoch) in pending {
            let tp = self.partition(partition);
            match self.metadata.end_offset(&tp) {
                Ok(offset) => {
                    self.unresolved.remove(&partition);
                    self.tracker.seed(partition, offset, epoch);
                    debug!(partition, epoch, target = offset, "Resolved sync target");
                }
                Err(e) => warn!(partition = %tp, error = %e, "End offset lookup failed, will retry"),
            }
        }
    }

    fn merge(&self, record: &Record) {
        let key: K = match codec::decode_key(&record.key) {
            Ok(key) => key,
            Err(e) => {
                warn!(partition = record.partition, offset = record.offset, error = %e, "Ignoring state record with undecodable key");
                return;
            }
        };
        let value = match codec::decode_state::<S>(record.value.as_ref()) {
            Ok(value) => value,
            Err(e) => {
                warn!(partition = record.partition, offset = record.offset, error = %e, "Ignoring undecodable state record");
                return;
            }
        };

        match self.cache.merge(record.partition, key, record.timestamp, value) {
            MergeOutcome::Applied => {}
            MergeOutcome::Stale => {
                debug!(partition = record.partition, offset = record.offset, "Skipped stale state record")
            }
            MergeOutcome::NotOwned => {
                debug!(partition = record.partition, offset = record.offset, "Skipped state record for unowned partition")
            }
        }
    }

    fn report_synced(&mut self) {
        for partition in self.tracker.pending() {
            let tp = self.partition(partition);
            let Some(position) = self.client.position(&tp) else {
                continue;
            };
            let Some(epoch) = self.tracker.epoch(partition) else {
                continue;
            };
            if !self.tracker.advance(partition, position) {
                continue;
            }

            // Revoked, or revoked and reassigned, while replaying.
            let Some(states) = self.cache.snapshot_at(partition, epoch) else {
                debug!(partition, epoch, "Replay finished for a superseded assignment");
                continue;
            };
            info!(partition, epoch, position, keys = states.len(), "State partition synced");
            self.listener
                .on_notification(Notification::PartitionSynced { partition, states });
            if self.synced.send(SyncEvent { partition, epoch }).is_err() {
                debug!(partition, "Event loop has stopped, dropping sync event");
            }
        }
    }

    fn partition(&self, partition: PartitionId) -> TopicPartition {
        TopicPartition::new(self.state_topic.clone(), partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateValue;
    use parking_lot::Mutex;
    use tandem_client::{BackendError, ClientConfig, FaultOp, MemoryBroker, OutboundRecord};

    type Seen = Arc<Mutex<Vec<Notification<String, String>>>>;

    struct Fixture {
        broker: MemoryBroker,
        cache: Arc<PartitionStateCache<String, String>>,
        state_loop: StateLoop<String, String>,
        commands: mpsc::UnboundedSender<StateCommand>,
        synced: mpsc::UnboundedReceiver<SyncEvent>,
        seen: Seen,
    }

    fn fixture(max_poll_records: usize) -> Fixture {
        let broker = MemoryBroker::new();
        broker.create_topic("state", 2, true).unwrap();

        let cache: Arc<PartitionStateCache<String, String>> = Arc::new(PartitionStateCache::new());
        let seen: Seen = Arc::default();
        let sink = Arc::clone(&seen);
        let listener = move |n: Notification<String, String>| sink.lock().push(n);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let consumer = broker.consumer("state-reader").with_max_poll_records(max_poll_records);
        let state_loop = StateLoop::new(
            ConsumerClient::new("state", Box::new(consumer), ClientConfig::default()),
            "state",
            Arc::clone(&cache),
            Arc::new(listener),
            Arc::new(broker.clone()),
            command_rx,
            synced_tx,
            Arc::new(shutdown),
            Duration::from_millis(10),
        );
        Fixture {
            broker,
            cache,
            state_loop,
            commands: command_tx,
            synced: synced_rx,
            seen,
        }
    }

    fn write_state(broker: &MemoryBroker, partition: PartitionId, count: usize) {
        for i in 0..count {
            broker
                .produce(
                    OutboundRecord::new("state", format!("\"key-{}-{}\"", partition, i), format!("\"v{}\"", i))
                        .with_partition(partition)
                        .with_timestamp(i as i64),
                )
                .unwrap();
        }
    }

    fn assign(f: &Fixture, partition: PartitionId, epoch: u64) {
        f.cache.allocate(partition, epoch);
        let target = f
            .broker
            .end_offset(&TopicPartition::new("state", partition))
            .unwrap();
        f.commands
            .send(StateCommand::Assign {
                partition,
                epoch,
                target: Some(target),
            })
            .unwrap();
    }

    #[tokio::test]
    async fn test_partitions_sync_independently() {
        let mut f = fixture(60);
        write_state(&f.broker, 0, 100);
        write_state(&f.broker, 1, 50);
        assign(&f, 0, 1);
        assign(&f, 1, 2);

        // 60 records of partition 0.
        f.state_loop.run_once().await.unwrap();
        assert!(f.synced.try_recv().is_err());

        // Remaining 40 of partition 0, then 20 of partition 1.
        f.state_loop.run_once().await.unwrap();
        assert_eq!(
            f.synced.try_recv().unwrap(),
            SyncEvent {
                partition: 0,
                epoch: 1
            }
        );
        assert!(f.synced.try_recv().is_err());
        assert!(f.state_loop.tracker().is_pending(1));
        {
            let seen = f.seen.lock();
            assert_eq!(seen.len(), 1);
            assert!(matches!(
                &seen[0],
                Notification::PartitionSynced { partition: 0, states } if states.len() == 100
            ));
        }

        f.state_loop.run_once().await.unwrap();
        assert_eq!(
            f.synced.try_recv().unwrap(),
            SyncEvent {
                partition: 1,
                epoch: 2
            }
        );
        assert_eq!(f.cache.snapshot(1).unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_empty_state_partition_syncs_on_first_poll() {
        let mut f = fixture(500);
        assign(&f, 1, 4);

        f.state_loop.run_once().await.unwrap();
        assert_eq!(
            f.synced.try_recv().unwrap(),
            SyncEvent {
                partition: 1,
                epoch: 4
            }
        );
    }

    #[tokio::test]
    async fn test_replay_applies_tombstones_after_compaction() {
        let mut f = fixture(500);
        let key = "\"K1\"";
        f.broker
            .produce(OutboundRecord::new("state", key, "\"old\"").with_partition(0).with_timestamp(1))
            .unwrap();
        f.broker
            .produce(OutboundRecord::new("state", "\"K2\"", "\"kept\"").with_partition(0).with_timestamp(2))
            .unwrap();
        f.broker
            .produce(OutboundRecord::tombstone("state", key).with_partition(0).with_timestamp(3))
            .unwrap();
        f.broker.compact("state").unwrap();

        assign(&f, 0, 1);
        f.state_loop.run_once().await.unwrap();

        assert_eq!(f.synced.try_recv().unwrap().partition, 0);
        assert_eq!(f.cache.get(&"K1".to_string()), None);
        assert_eq!(f.cache.get(&"K2".to_string()), Some("kept".to_string()));
        assert_eq!(
            f.cache.get_in(0, &"K1".to_string()).map(|e| e.value),
            Some(StateValue::Tombstone)
        );
    }

    #[tokio::test]
    async fn test_revoke_before_sync_suppresses_notification() {
        let mut f = fixture(10);
        write_state(&f.broker, 0, 30);
        assign(&f, 0, 1);

        f.state_loop.run_once().await.unwrap();
        f.cache.discard(0);
        f.commands.send(StateCommand::Revoke { partition: 0 }).unwrap();
        f.state_loop.run_once().await.unwrap();
        f.state_loop.run_once().await.unwrap();

        assert!(!f.state_loop.tracker().is_pending(0));
        assert!(f.synced.try_recv().is_err());
        assert!(f.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_records_are_ignored() {
        let mut f = fixture(500);
        f.broker
            .produce(OutboundRecord::new("state", "not-json", "\"v\"").with_partition(0))
            .unwrap();
        f.broker
            .produce(OutboundRecord::new("state", "\"K\"", "{broken").with_partition(0))
            .unwrap();
        assign(&f, 0, 1);

        f.state_loop.run_once().await.unwrap();
        assert_eq!(f.synced.try_recv().unwrap().partition, 0);
        assert!(f.cache.snapshot(0).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reassignment_during_poll_reports_only_new_owner() {
        let mut f = fixture(500);
        write_state(&f.broker, 0, 5);
        assign(&f, 0, 1);
        f.state_loop.apply_commands().unwrap();

        let records = f.state_loop.client.poll(Duration::from_millis(10)).await.unwrap();
        for record in &records {
            f.state_loop.merge(record);
        }
        // The event side revokes and reassigns before its commands arrive.
        f.cache.discard(0);
        f.cache.allocate(0, 2);
        f.state_loop.report_synced();

        assert!(f.synced.try_recv().is_err());
        assert!(f.seen.lock().is_empty());

        f.commands.send(StateCommand::Revoke { partition: 0 }).unwrap();
        f.commands
            .send(StateCommand::Assign {
                partition: 0,
                epoch: 2,
                target: Some(5),
            })
            .unwrap();
        f.state_loop.run_once().await.unwrap();

        assert_eq!(
            f.synced.try_recv().unwrap(),
            SyncEvent {
                partition: 0,
                epoch: 2
            }
        );
        let seen = f.seen.lock();
        assert_eq!(seen.len(), 1);
        assert!(matches!(
            &seen[0],
            Notification::PartitionSynced { partition: 0, states } if states.len() == 5
        ));
    }

    #[tokio::test]
    async fn test_commands_sent_during_poll_apply_before_reporting() {
        let mut f = fixture(500);
        write_state(&f.broker, 0, 3);
        assign(&f, 0, 1);
        f.state_loop.apply_commands().unwrap();

        // Queued after this iteration's first drain.
        f.cache.discard(0);
        f.commands.send(StateCommand::Revoke { partition: 0 }).unwrap();
        let records = f.state_loop.client.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(records.len(), 3);
        f.state_loop.apply_commands().unwrap();
        f.state_loop.report_synced();

        assert!(!f.state_loop.tracker().is_pending(0));
        assert!(f.synced.try_recv().is_err());
        assert!(f.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_target_is_resolved_on_a_later_iteration() {
        let mut f = fixture(500);
        write_state(&f.broker, 0, 3);
        f.cache.allocate(0, 1);
        f.commands
            .send(StateCommand::Assign {
                partition: 0,
                epoch: 1,
                target: None,
            })
            .unwrap();
        f.broker
            .inject_fault(FaultOp::EndOffset, BackendError::Timeout("metadata".into()));

        // Replays, but cannot decide it is caught up.
        f.state_loop.run_once().await.unwrap();
        assert!(!f.state_loop.tracker().is_pending(0));
        assert!(f.synced.try_recv().is_err());
        assert_eq!(f.cache.snapshot(0).unwrap().len(), 3);

        f.state_loop.run_once().await.unwrap();
        assert_eq!(
            f.synced.try_recv().unwrap(),
            SyncEvent {
                partition: 0,
                epoch: 1
            }
        );
        assert_eq!(f.seen.lock().len(), 1);
    }
}
