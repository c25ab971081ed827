//! Record types exchanged with the messaging collaborator.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one shard of a topic.
pub type PartitionId = u32;

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: PartitionId,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: PartitionId) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// A record consumed from a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Topic the record was consumed from
    pub topic: String,
    /// Partition number
    pub partition: PartitionId,
    /// Record offset within the partition
    pub offset: u64,
    /// Timestamp in milliseconds since epoch
    pub timestamp: i64,
    /// Record key
    pub key: Bytes,
    /// Record payload. `None` on a compacted topic is a tombstone.
    pub value: Option<Bytes>,
}

impl Record {
    pub fn topic_partition(&self) -> TopicPartition {
        TopicPartition::new(self.topic.clone(), self.partition)
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// A record to be published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundRecord {
    pub topic: String,
    /// Explicit partition; when `None` the partition is derived from the key.
    pub partition: Option<PartitionId>,
    pub key: Bytes,
    pub value: Option<Bytes>,
    /// Timestamp in milliseconds since epoch; when `None` the broker stamps it.
    pub timestamp: Option<i64>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: key.into(),
            value: Some(value.into()),
            timestamp: None,
        }
    }

    /// A record with a null payload (deletes the key on a compacted topic).
    pub fn tombstone(topic: impl Into<String>, key: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: key.into(),
            value: None,
            timestamp: None,
        }
    }

    pub fn with_partition(mut self, partition: PartitionId) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}
