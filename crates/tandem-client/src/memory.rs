//! In-process broker implementing the collaborator contract.
//!
//! [`MemoryBroker`] keeps every topic in memory and offers:
//! - Fixed partition counts per topic, key routing via murmur2
//! - Compacted topics (explicit [`MemoryBroker::compact`])
//! - Consumer groups with generation-based incremental assignment
//! - Manual assignment, seek, pause/resume, per-group committed offsets
//! - Member expiry, which surfaces as partition loss on the next poll
//! - One-shot fault injection per operation, and one-shot stalls
//!
//! # Example
//!
//! ```rust,ignore
//! let broker = MemoryBroker::new();
//! broker.create_topic("events", 4, false)?;
//! broker.create_topic("events.state", 4, true)?;
//!
//! let consumer = broker.consumer("cleanup-workers");
//! let producer = broker.producer();
//! ```

use crate::backend::{
    BackendResult, LogConsumer, LogMetadata, LogProducer, PartitionControl, RebalanceListener,
};
use crate::error::BackendError;
use crate::partitioner::partition_for_key;
use crate::record::{OutboundRecord, PartitionId, Record, TopicPartition};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Operations that can be made to fail with [`MemoryBroker::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOp {
    Subscribe,
    Poll,
    Commit,
    Send,
    Close,
    /// [`LogMetadata::end_offset`]
    EndOffset,
}

/// Shared handle to an in-memory broker. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    /// Woken on every append and group membership change
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    faults: VecDeque<(FaultOp, BackendError)>,
    stalls: Vec<FaultOp>,
    next_member_id: u64,
}

struct TopicLog {
    compacted: bool,
    partitions: Vec<PartitionLog>,
}

#[derive(Default)]
struct PartitionLog {
    /// Ordered by offset; compaction leaves gaps
    records: Vec<StoredRecord>,
    next_offset: u64,
}

impl PartitionLog {
    fn start_offset(&self) -> u64 {
        self.records
            .first()
            .map(|r| r.offset)
            .unwrap_or(self.next_offset)
    }
}

#[derive(Clone)]
struct StoredRecord {
    offset: u64,
    timestamp: i64,
    key: Bytes,
    value: Option<Bytes>,
}

impl StoredRecord {
    fn to_record(&self, tp: &TopicPartition) -> Record {
        Record {
            topic: tp.topic.clone(),
            partition: tp.partition,
            offset: self.offset,
            timestamp: self.timestamp,
            key: self.key.clone(),
            value: self.value.clone(),
        }
    }
}

#[derive(Default)]
struct GroupState {
    generation: u64,
    /// member id → subscribed topics
    members: BTreeMap<String, Vec<String>>,
    /// Expired members that have not noticed yet, with their topics
    expired: HashMap<String, Vec<String>>,
    committed: HashMap<TopicPartition, u64>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a topic. `compacted` topics may be compacted with [`compact`](Self::compact).
    pub fn create_topic(
        &self,
        name: impl Into<String>,
        partitions: u32,
        compacted: bool,
    ) -> BackendResult<()> {
        let name = name.into();
        if partitions == 0 {
            return Err(BackendError::InvalidArgument(format!(
                "topic {} needs at least one partition",
                name
            )));
        }

        let mut state = self.inner.state.lock();
        if state.topics.contains_key(&name) {
            return Err(BackendError::InvalidArgument(format!(
                "topic {} already exists",
                name
            )));
        }
        state.topics.insert(
            name.clone(),
            TopicLog {
                compacted,
                partitions: (0..partitions).map(|_| PartitionLog::default()).collect(),
            },
        );
        info!(topic = %name, partitions, compacted, "Topic created");
        Ok(())
    }

    /// Append one record, returning its partition and offset.
    pub fn produce(&self, record: OutboundRecord) -> BackendResult<(PartitionId, u64)> {
        let placed = {
            let mut state = self.inner.state.lock();
            Self::validate(&state, &record)?;
            Self::append(&mut state, record)
        };
        self.inner.notify.notify_waiters();
        Ok(placed)
    }

    /// Keep only the latest record per key in every partition of a compacted
    /// topic. Tombstones are retained. Returns the number of records removed.
    pub fn compact(&self, topic: &str) -> BackendResult<usize> {
        let mut state = self.inner.state.lock();
        let log = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| BackendError::UnknownTopic(topic.to_string()))?;
        if !log.compacted {
            return Err(BackendError::InvalidArgument(format!(
                "topic {} is not compacted",
                topic
            )));
        }

        let mut removed = 0;
        for partition in &mut log.partitions {
            let mut seen = HashSet::new();
            let mut keep = vec![false; partition.records.len()];
            for (i, record) in partition.records.iter().enumerate().rev() {
                keep[i] = seen.insert(record.key.clone());
            }
            let before = partition.records.len();
            let mut flags = keep.into_iter();
            partition
                .records
                .retain(|_| flags.next().unwrap_or(true));
            removed += before - partition.records.len();
        }
        debug!(topic, removed, "Topic compacted");
        Ok(removed)
    }

    /// A new consumer for `group_id`. It joins the group on `subscribe`.
    pub fn consumer(&self, group_id: impl Into<String>) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.into(),
            member_id: None,
            listener: None,
            generation: 0,
            partitions: ConsumerPartitions::default(),
            owned: BTreeSet::new(),
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            closed: false,
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            closed: false,
        }
    }

    /// Every record currently stored in `partition`.
    pub fn records(&self, partition: &TopicPartition) -> Vec<Record> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(&partition.topic)
            .and_then(|t| t.partitions.get(partition.partition as usize))
            .map(|log| log.records.iter().map(|r| r.to_record(partition)).collect())
            .unwrap_or_default()
    }

    pub fn committed_offset(&self, group_id: &str, partition: &TopicPartition) -> Option<u64> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(partition).copied())
    }

    pub fn group_members(&self, group_id: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .map(|g| g.members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop a member from its group as if its session timed out. The member
    /// learns about it on its next poll, loses its partitions and rejoins.
    pub fn expire_member(&self, group_id: &str, member_id: &str) -> bool {
        let expired = {
            let mut state = self.inner.state.lock();
            match state.groups.get_mut(group_id) {
                Some(group) => match group.members.remove(member_id) {
                    Some(topics) => {
                        group.expired.insert(member_id.to_string(), topics);
                        group.generation += 1;
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if expired {
            info!(group_id, member_id, "Member expired");
            self.inner.notify.notify_waiters();
        }
        expired
    }

    /// Make the next `op` (by any client of this broker) fail with `error`.
    pub fn inject_fault(&self, op: FaultOp, error: BackendError) {
        self.inner.state.lock().faults.push_back((op, error));
    }

    pub fn pending_faults(&self) -> usize {
        self.inner.state.lock().faults.len()
    }

    /// Make the next `op` that supports stalling never complete. Only
    /// [`FaultOp::Close`] does.
    pub fn inject_stall(&self, op: FaultOp) {
        self.inner.state.lock().stalls.push(op);
    }

    fn take_stall(&self, op: FaultOp) -> bool {
        let mut state = self.inner.state.lock();
        match state.stalls.iter().position(|o| *o == op) {
            Some(index) => {
                state.stalls.remove(index);
                true
            }
            None => false,
        }
    }

    async fn stall_if_injected(&self, op: FaultOp) {
        if self.take_stall(op) {
            debug!(op = ?op, "Stalling");
            std::future::pending::<()>().await;
        }
    }

    fn take_fault(&self, op: FaultOp) -> Option<BackendError> {
        let mut state = self.inner.state.lock();
        let index = state.faults.iter().position(|(o, _)| *o == op)?;
        state.faults.remove(index).map(|(_, e)| e)
    }

    fn validate(state: &BrokerState, record: &OutboundRecord) -> BackendResult<()> {
        let log = state
            .topics
            .get(&record.topic)
            .ok_or_else(|| BackendError::UnknownTopic(record.topic.clone()))?;
        if let Some(partition) = record.partition {
            if partition as usize >= log.partitions.len() {
                return Err(BackendError::InvalidArgument(format!(
                    "partition {} out of range for topic {} ({} partitions)",
                    partition,
                    record.topic,
                    log.partitions.len()
                )));
            }
        }
        Ok(())
    }

    /// Caller must have validated the record.
    fn append(state: &mut BrokerState, record: OutboundRecord) -> (PartitionId, u64) {
        let timestamp = record
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let Some(log) = state.topics.get_mut(&record.topic) else {
            return (0, 0);
        };
        let partition = record
            .partition
            .unwrap_or_else(|| partition_for_key(&record.key, log.partitions.len() as u32));
        let Some(plog) = log.partitions.get_mut(partition as usize) else {
            return (partition, 0);
        };

        let offset = plog.next_offset;
        plog.records.push(StoredRecord {
            offset,
            timestamp,
            key: record.key,
            value: record.value,
        });
        plog.next_offset += 1;
        (partition, offset)
    }

    fn assignment_for(
        topics: &HashMap<String, TopicLog>,
        group: &GroupState,
        member_id: &str,
    ) -> BTreeSet<TopicPartition> {
        let mut assignment = BTreeSet::new();
        let Some(subscribed) = group.members.get(member_id) else {
            return assignment;
        };

        for topic in subscribed {
            let Some(log) = topics.get(topic) else {
                continue;
            };
            let subscribers: Vec<&String> = group
                .members
                .iter()
                .filter(|(_, t)| t.contains(topic))
                .map(|(m, _)| m)
                .collect();
            let Some(index) = subscribers.iter().position(|m| m.as_str() == member_id) else {
                continue;
            };
            // Round-robin over members sorted by id.
            for partition in 0..log.partitions.len() {
                if partition % subscribers.len() == index {
                    assignment.insert(TopicPartition::new(topic.clone(), partition as u32));
                }
            }
        }
        assignment
    }
}

impl LogMetadata for MemoryBroker {
    fn partition_count(&self, topic: &str) -> BackendResult<u32> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|t| t.partitions.len() as u32)
            .ok_or_else(|| BackendError::UnknownTopic(topic.to_string()))
    }

    fn end_offset(&self, partition: &TopicPartition) -> BackendResult<u64> {
        if let Some(err) = self.take_fault(FaultOp::EndOffset) {
            return Err(err);
        }
        let state = self.inner.state.lock();
        let log = state
            .topics
            .get(&partition.topic)
            .ok_or_else(|| BackendError::UnknownTopic(partition.topic.clone()))?;
        log.partitions
            .get(partition.partition as usize)
            .map(|p| p.next_offset)
            .ok_or_else(|| BackendError::InvalidArgument(format!("unknown partition {}", partition)))
    }
}

/// Fetch positions and pause flags of one consumer.
#[derive(Default)]
struct ConsumerPartitions {
    positions: BTreeMap<TopicPartition, u64>,
    paused: BTreeSet<TopicPartition>,
}

impl ConsumerPartitions {
    fn ensure_assigned(&self, partitions: &[TopicPartition]) -> BackendResult<()> {
        match partitions.iter().find(|tp| !self.positions.contains_key(*tp)) {
            Some(tp) => Err(BackendError::IllegalState(format!(
                "partition {} is not assigned",
                tp
            ))),
            None => Ok(()),
        }
    }

    fn remove(&mut self, partition: &TopicPartition) {
        self.positions.remove(partition);
        self.paused.remove(partition);
    }
}

impl PartitionControl for ConsumerPartitions {
    fn pause(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_assigned(partitions)?;
        self.paused.extend(partitions.iter().cloned());
        Ok(())
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_assigned(partitions)?;
        for tp in partitions {
            self.paused.remove(tp);
        }
        Ok(())
    }

    fn paused(&self) -> Vec<TopicPartition> {
        self.paused.iter().cloned().collect()
    }
}

/// Consumer side of [`MemoryBroker`].
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    member_id: Option<String>,
    listener: Option<Arc<dyn RebalanceListener>>,
    /// Group generation this consumer last rebalanced to
    generation: u64,
    partitions: ConsumerPartitions,
    /// Partitions owned through the group subscription
    owned: BTreeSet<TopicPartition>,
    max_poll_records: usize,
    closed: bool,
}

impl MemoryConsumer {
    /// Cap on records returned by one poll across all partitions.
    pub fn with_max_poll_records(mut self, max: usize) -> Self {
        self.max_poll_records = max.max(1);
        self
    }

    pub fn member_id(&self) -> Option<&str> {
        self.member_id.as_deref()
    }

    fn ensure_open(&self) -> BackendResult<()> {
        if self.closed {
            Err(BackendError::Closed)
        } else {
            Ok(())
        }
    }

    /// Apply a pending group rebalance, invoking the listener.
    fn rebalance(&mut self) {
        let (Some(member_id), Some(listener)) = (self.member_id.clone(), self.listener.clone())
        else {
            return;
        };

        let (lost, target, generation, committed) = {
            let mut guard = self.broker.inner.state.lock();
            let state = &mut *guard;
            let Some(group) = state.groups.get_mut(&self.group_id) else {
                return;
            };

            let lost = match group.expired.remove(&member_id) {
                Some(topics) => {
                    group.members.insert(member_id.clone(), topics);
                    group.generation += 1;
                    true
                }
                None => false,
            };
            if !lost && group.generation == self.generation {
                return;
            }

            let target = MemoryBroker::assignment_for(&state.topics, group, &member_id);
            let committed: HashMap<TopicPartition, u64> = target
                .iter()
                .filter_map(|tp| group.committed.get(tp).map(|o| (tp.clone(), *o)))
                .collect();
            (lost, target, group.generation, committed)
        };
        if lost {
            // Rejoining bumped the generation; wake the other members.
            self.broker.inner.notify.notify_waiters();
        }

        if lost && !self.owned.is_empty() {
            let partitions: Vec<TopicPartition> = std::mem::take(&mut self.owned).into_iter().collect();
            info!(group_id = %self.group_id, member_id = %member_id, partitions = ?partitions, "Partitions lost");
            listener.on_partitions_lost(&mut self.partitions, &partitions);
            for tp in &partitions {
                self.partitions.remove(tp);
            }
        }

        let revoked: Vec<TopicPartition> = self.owned.difference(&target).cloned().collect();
        if !revoked.is_empty() {
            info!(group_id = %self.group_id, member_id = %member_id, partitions = ?revoked, "Partitions revoked");
            listener.on_partitions_revoked(&mut self.partitions, &revoked);
            for tp in &revoked {
                self.partitions.remove(tp);
                self.owned.remove(tp);
            }
        }

        let assigned: Vec<TopicPartition> = target.difference(&self.owned).cloned().collect();
        for tp in &assigned {
            let position = committed.get(tp).copied().unwrap_or(0);
            self.partitions.positions.insert(tp.clone(), position);
            self.owned.insert(tp.clone());
        }
        self.generation = generation;

        if !assigned.is_empty() {
            info!(group_id = %self.group_id, member_id = %member_id, generation, partitions = ?assigned, "Partitions assigned");
            listener.on_partitions_assigned(&mut self.partitions, &assigned);
        }
    }

    fn fetch(&mut self) -> Vec<Record> {
        let max = self.max_poll_records;
        let state = self.broker.inner.state.lock();
        let ConsumerPartitions { positions, paused } = &mut self.partitions;

        let mut records = Vec::new();
        for (tp, position) in positions.iter_mut() {
            if records.len() >= max {
                break;
            }
            if paused.contains(tp) {
                continue;
            }
            let Some(log) = state
                .topics
                .get(&tp.topic)
                .and_then(|t| t.partitions.get(tp.partition as usize))
            else {
                continue;
            };

            let start = log.records.partition_point(|r| r.offset < *position);
            let end = (start + (max - records.len())).min(log.records.len());
            let batch = &log.records[start..end];
            match batch.last() {
                Some(last) => *position = last.offset + 1,
                // Skip over compacted-away tail records.
                None if *position < log.next_offset => *position = log.next_offset,
                None => {}
            }
            records.extend(batch.iter().map(|r| r.to_record(tp)));
        }
        records
    }
}

impl PartitionControl for MemoryConsumer {
    fn pause(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_open()?;
        self.partitions.pause(partitions)
    }

    fn resume(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_open()?;
        self.partitions.resume(partitions)
    }

    fn paused(&self) -> Vec<TopicPartition> {
        self.partitions.paused()
    }
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> BackendResult<()> {
        self.ensure_open()?;
        if let Some(err) = self.broker.take_fault(FaultOp::Subscribe) {
            return Err(err);
        }
        if self.member_id.is_some() {
            return Err(BackendError::IllegalState(
                "consumer is already subscribed".to_string(),
            ));
        }
        if topics.is_empty() {
            return Err(BackendError::InvalidArgument(
                "subscription needs at least one topic".to_string(),
            ));
        }

        let member_id = {
            let mut state = self.broker.inner.state.lock();
            if let Some(missing) = topics.iter().find(|t| !state.topics.contains_key(*t)) {
                return Err(BackendError::UnknownTopic(missing.clone()));
            }
            state.next_member_id += 1;
            let member_id = format!("{}-member-{}", self.group_id, state.next_member_id);
            let group = state.groups.entry(self.group_id.clone()).or_default();
            group.members.insert(member_id.clone(), topics.to_vec());
            group.generation += 1;
            member_id
        };
        self.broker.inner.notify.notify_waiters();

        info!(group_id = %self.group_id, member_id = %member_id, topics = ?topics, "Member joined group");
        self.member_id = Some(member_id);
        self.listener = Some(listener);
        Ok(())
    }

    fn assign(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_open()?;
        let state = self.broker.inner.state.lock();
        for tp in partitions {
            let log = state
                .topics
                .get(&tp.topic)
                .ok_or_else(|| BackendError::UnknownTopic(tp.topic.clone()))?;
            if tp.partition as usize >= log.partitions.len() {
                return Err(BackendError::InvalidArgument(format!("unknown partition {}", tp)));
            }
        }
        for tp in partitions {
            if !self.partitions.positions.contains_key(tp) {
                let position = state
                    .groups
                    .get(&self.group_id)
                    .and_then(|g| g.committed.get(tp).copied())
                    .unwrap_or(0);
                self.partitions.positions.insert(tp.clone(), position);
            }
        }
        Ok(())
    }

    fn unassign(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_open()?;
        for tp in partitions {
            self.partitions.remove(tp);
        }
        Ok(())
    }

    fn seek(&mut self, partition: &TopicPartition, offset: u64) -> BackendResult<()> {
        self.ensure_open()?;
        self.partitions.ensure_assigned(std::slice::from_ref(partition))?;
        self.partitions.positions.insert(partition.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> BackendResult<()> {
        self.ensure_open()?;
        self.partitions.ensure_assigned(partitions)?;
        let state = self.broker.inner.state.lock();
        for tp in partitions {
            let start = state
                .topics
                .get(&tp.topic)
                .and_then(|t| t.partitions.get(tp.partition as usize))
                .map(PartitionLog::start_offset)
                .unwrap_or(0);
            self.partitions.positions.insert(tp.clone(), start);
        }
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> BackendResult<Vec<Record>> {
        self.ensure_open()?;
        if let Some(err) = self.broker.take_fault(FaultOp::Poll) {
            return Err(err);
        }

        let inner = Arc::clone(&self.broker.inner);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            // Register before looking so an append in between is not missed.
            notified.as_mut().enable();

            self.rebalance();
            let records = self.fetch();
            if !records.is_empty() {
                return Ok(records);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, partition: &TopicPartition, next_offset: u64) -> BackendResult<()> {
        self.ensure_open()?;
        if let Some(err) = self.broker.take_fault(FaultOp::Commit) {
            return Err(err);
        }
        self.partitions
            .ensure_assigned(std::slice::from_ref(partition))?;

        let mut state = self.broker.inner.state.lock();
        state
            .groups
            .entry(self.group_id.clone())
            .or_default()
            .committed
            .insert(partition.clone(), next_offset);
        Ok(())
    }

    fn position(&self, partition: &TopicPartition) -> Option<u64> {
        self.partitions.positions.get(partition).copied()
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.partitions.positions.keys().cloned().collect()
    }

    async fn close(&mut self) -> BackendResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.broker.stall_if_injected(FaultOp::Close).await;
        let fault = self.broker.take_fault(FaultOp::Close);

        if let Some(member_id) = self.member_id.take() {
            {
                let mut state = self.broker.inner.state.lock();
                if let Some(group) = state.groups.get_mut(&self.group_id) {
                    if group.members.remove(&member_id).is_some() {
                        group.generation += 1;
                    }
                    group.expired.remove(&member_id);
                }
            }
            self.broker.inner.notify.notify_waiters();
            info!(group_id = %self.group_id, member_id = %member_id, "Member left group");
        }
        self.partitions = ConsumerPartitions::default();
        self.owned.clear();

        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Producer side of [`MemoryBroker`].
pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: bool,
}

#[async_trait]
impl LogProducer for MemoryProducer {
    async fn send(&mut self, records: Vec<OutboundRecord>) -> BackendResult<()> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        if let Some(err) = self.broker.take_fault(FaultOp::Send) {
            return Err(err);
        }

        {
            let mut state = self.broker.inner.state.lock();
            // All or nothing.
            for record in &records {
                MemoryBroker::validate(&state, record)?;
            }
            for record in records {
                MemoryBroker::append(&mut state, record);
            }
        }
        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&mut self) -> BackendResult<()> {
        self.closed = true;
        self.broker.stall_if_injected(FaultOp::Close).await;
        match self.broker.take_fault(FaultOp::Close) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
