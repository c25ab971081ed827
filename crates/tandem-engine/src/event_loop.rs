//! Feeds events of synced partitions through the processor.
//!
//! Events of one partition are handled in offset order, whatever order the
//! client returned them in. Per event: decode, look up the key's state, call
//! the processor, publish its output together with the new state record,
//! commit the event, then apply the committed state to the cache. A
//! processor failure rewinds the partition to that event and skips the rest
//! of its batch, so nothing after an uncommitted event is committed.

use crate::codec;
use crate::coordinator::{RebalanceCoordinator, SyncEvent};
use crate::engine::SharedState;
use crate::error::Result;
use crate::processor::{EventRecord, ProcessorResult, StateAndEventProcessor};
use crate::state::{EventData, StateData, StateEntry, StateKey, StateValue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ConsumerClient, OutboundRecord, PartitionId, ProducerClient, Record};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

pub(crate) struct EventLoop<K, S, E> {
    client: ConsumerClient,
    producer: ProducerClient,
    state_topic: String,
    coordinator: Arc<RebalanceCoordinator<K, S>>,
    shared: Arc<SharedState<K, S>>,
    processor: Arc<dyn StateAndEventProcessor<K, S, E>>,
    synced: mpsc::UnboundedReceiver<SyncEvent>,
    shutdown: Arc<watch::Sender<bool>>,
    poll_timeout: Duration,
    /// Highest offset committed per partition, as next offset to read
    committed: HashMap<PartitionId, u64>,
}

/// How one event ended
enum Outcome {
    Committed,
    /// Not committed; the partition must be rewound to this event
    Retry,
}

impl<K: StateKey, S: StateData, E: EventData> EventLoop<K, S, E> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        client: ConsumerClient,
        producer: ProducerClient,
        state_topic: impl Into<String>,
        coordinator: Arc<RebalanceCoordinator<K, S>>,
        shared: Arc<SharedState<K, S>>,
        processor: Arc<dyn StateAndEventProcessor<K, S, E>>,
        synced: mpsc::UnboundedReceiver<SyncEvent>,
        shutdown: Arc<watch::Sender<bool>>,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            client,
            producer,
            state_topic: state_topic.into(),
            coordinator,
            shared,
            processor,
            synced,
            shutdown,
            poll_timeout,
            committed: HashMap::new(),
        }
    }

    /// Run until shutdown or a fatal error, then stop the state loop too and
    /// close the event consumer and the producer.
    pub(crate) async fn run(mut self) -> Result<()> {
        info!(client = %self.client.name(), "Event loop started");
        let mut result = Ok(());
        while !*self.shutdown.borrow() {
            if let Err(e) = self.run_once().await {
                error!(client = %self.client.name(), error = %e, "Event loop failed");
                result = Err(e);
                break;
            }
        }

        self.shutdown.send_replace(true);
        self.client.close().await;
        self.producer.close().await;
        info!(client = %self.client.name(), "Event loop stopped");
        result
    }

    pub(crate) async fn run_once(&mut self) -> Result<()> {
        self.resume_synced()?;

        let mut records = self.client.poll(self.poll_timeout).await?;
        if records.is_empty() {
            return Ok(());
        }
        records.sort_by_key(|r| (r.partition, r.offset));

        // Offset each failed partition must be re-read from.
        let mut rewind: HashMap<PartitionId, u64> = HashMap::new();
        for record in &records {
            if rewind.contains_key(&record.partition) {
                continue;
            }
            if !self.coordinator.is_active(record.partition) {
                debug!(partition = record.partition, offset = record.offset, "Skipping event for inactive partition");
                continue;
            }
            if let Outcome::Retry = self.process(record).await? {
                rewind.insert(record.partition, record.offset);
            }
        }

        for (partition, offset) in rewind {
            let tp = self.coordinator.event_partition(partition);
            self.client.seek(&tp, offset)?;
            debug!(partition, offset, "Rewound partition for redelivery");
        }
        Ok(())
    }

    fn resume_synced(&mut self) -> Result<()> {
        while let Ok(SyncEvent { partition, epoch }) = self.synced.try_recv() {
            if !self.coordinator.mark_synced(partition, epoch) {
                continue;
            }
            let tp = self.coordinator.event_partition(partition);
            match self.client.resume(std::slice::from_ref(&tp)) {
                Ok(()) => info!(partition, epoch, "Partition active"),
                Err(e) if !e.is_fatal() => {
                    warn!(partition, error = %e, "Resume failed, partition stays paused")
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn process(&mut self, record: &Record) -> Result<Outcome> {
        let event = match Self::decode(record) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Skipping undecodable event"
                );
                self.commit(record).await?;
                return Ok(Outcome::Committed);
            }
        };

        let stored = self.shared.cache.get_in(event.partition, &event.key);
        let current = stored.as_ref().and_then(|entry| entry.value.as_present());
        let result = match self.processor.on_next(current, &event) {
            Ok(result) => result,
            Err(e) => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Processor failed, event will be redelivered"
                );
                return Ok(Outcome::Retry);
            }
        };

        // Never older than what is cached, so replaying our own write cannot lose.
        let now = chrono::Utc::now().timestamp_millis();
        let timestamp = stored.map_or(now, |entry| entry.timestamp.max(now));
        let ProcessorResult { new_state, mut output } = result;
        let state_record = match self.state_record(&event, &new_state, timestamp) {
            Ok(state_record) => state_record,
            Err(e) => {
                warn!(
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to encode new state, event will be redelivered"
                );
                return Ok(Outcome::Retry);
            }
        };
        output.push(state_record);

        self.producer.send(output).await?;
        self.commit(record).await?;

        let updates = HashMap::from([(
            event.partition,
            HashMap::from([(event.key, StateEntry::new(timestamp, new_state))]),
        )]);
        self.shared.on_processor_state_updated(updates);
        Ok(Outcome::Committed)
    }

    /// Commit past `record` unless a later offset of its partition already is.
    async fn commit(&mut self, record: &Record) -> Result<()> {
        let next = record.offset + 1;
        if let Some(&committed) = self.committed.get(&record.partition) {
            if committed >= next {
                debug!(
                    partition = record.partition,
                    offset = record.offset,
                    committed,
                    "Offset already committed"
                );
                return Ok(());
            }
        }
        self.client.commit(record).await?;
        self.committed.insert(record.partition, next);
        Ok(())
    }

    fn decode(record: &Record) -> Result<EventRecord<K, E>> {
        Ok(EventRecord {
            partition: record.partition,
            offset: record.offset,
            timestamp: record.timestamp,
            key: codec::decode_key(&record.key)?,
            value: codec::decode_event(record.value.as_ref())?,
        })
    }

    fn state_record(
        &self,
        event: &EventRecord<K, E>,
        state: &StateValue<S>,
        timestamp: i64,
    ) -> Result<OutboundRecord> {
        let key = codec::encode_key(&event.key)?;
        let record = match codec::encode_state(state)? {
            Some(value) => OutboundRecord::new(self.state_topic.clone(), key, value),
            None => OutboundRecord::tombstone(self.state_topic.clone(), key),
        };
        Ok(record.with_partition(event.partition).with_timestamp(timestamp))
    }
}
