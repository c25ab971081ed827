//! Interface boundary of the messaging collaborator.
//!
//! The engine never talks to a broker directly. It drives implementations of
//! these traits through the retry-aware wrappers in [`crate::consumer`] and
//! [`crate::producer`]. [`crate::memory`] provides an in-process
//! implementation.

use crate::error::BackendError;
use crate::record::{OutboundRecord, Record, TopicPartition};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Pause/resume access handed to rebalance callbacks.
pub trait PartitionControl: Send {
    /// Stop yielding records for the given partitions.
    fn pause(&mut self, partitions: &[TopicPartition]) -> BackendResult<()>;

    /// Yield records for the given partitions again.
    fn resume(&mut self, partitions: &[TopicPartition]) -> BackendResult<()>;

    /// Currently paused partitions.
    fn paused(&self) -> Vec<TopicPartition>;
}

/// Consumer-group rebalance callbacks.
///
/// Invoked by the collaborator from inside [`LogConsumer::poll`] on the
/// polling task.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_assigned(
        &self,
        control: &mut dyn PartitionControl,
        partitions: &[TopicPartition],
    );

    fn on_partitions_revoked(
        &self,
        control: &mut dyn PartitionControl,
        partitions: &[TopicPartition],
    );

    /// Partitions taken away without an orderly revoke (session expiry,
    /// fencing). Defaults to the revoke path.
    fn on_partitions_lost(&self, control: &mut dyn PartitionControl, partitions: &[TopicPartition]) {
        self.on_partitions_revoked(control, partitions);
    }
}

/// One consumer of the partitioned log.
#[async_trait]
pub trait LogConsumer: PartitionControl {
    /// Join the consumer group for `topics`. Partitions are assigned by the
    /// group and announced through `listener`.
    async fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> BackendResult<()>;

    /// Add partitions to the manual assignment.
    fn assign(&mut self, partitions: &[TopicPartition]) -> BackendResult<()>;

    /// Remove partitions from the manual assignment.
    fn unassign(&mut self, partitions: &[TopicPartition]) -> BackendResult<()>;

    /// Set the next offset to fetch for an assigned partition.
    fn seek(&mut self, partition: &TopicPartition, offset: u64) -> BackendResult<()>;

    fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> BackendResult<()>;

    /// Fetch at most one batch, waiting up to `timeout` when nothing is
    /// available.
    async fn poll(&mut self, timeout: Duration) -> BackendResult<Vec<Record>>;

    /// Commit `next_offset` (the offset of the next record to consume).
    async fn commit(&mut self, partition: &TopicPartition, next_offset: u64) -> BackendResult<()>;

    /// Next offset to fetch for an assigned partition.
    fn position(&self, partition: &TopicPartition) -> Option<u64>;

    fn assignment(&self) -> Vec<TopicPartition>;

    /// Leave the group and release resources.
    async fn close(&mut self) -> BackendResult<()>;
}

/// Publisher of records.
#[async_trait]
pub trait LogProducer: Send {
    async fn send(&mut self, records: Vec<OutboundRecord>) -> BackendResult<()>;

    async fn close(&mut self) -> BackendResult<()>;
}

/// Topic metadata lookups.
pub trait LogMetadata: Send + Sync {
    fn partition_count(&self, topic: &str) -> BackendResult<u32>;

    /// Offset the next record written to `partition` will receive.
    fn end_offset(&self, partition: &TopicPartition) -> BackendResult<u64>;
}
