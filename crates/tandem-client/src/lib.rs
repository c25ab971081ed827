//! # tandem-client
//!
//! Access to the partitioned logs underneath the tandem engine.
//!
//! - [`backend`] - the traits a messaging system implements
//!   ([`LogConsumer`], [`LogProducer`], [`LogMetadata`], [`RebalanceListener`])
//! - [`ConsumerClient`] / [`ProducerClient`] - retry-aware wrappers that own
//!   error classification, timestamp-ordered polling and bounded close
//! - [`memory`] - an in-process broker with consumer groups and compaction
//! - [`partitioner`] - Kafka-compatible key → partition hashing

pub mod backend;
pub mod config;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod partitioner;
pub mod producer;
pub mod record;

pub use backend::{
    BackendResult, LogConsumer, LogMetadata, LogProducer, PartitionControl, RebalanceListener,
};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use consumer::ConsumerClient;
pub use error::{BackendError, Error, Result};
pub use memory::{FaultOp, MemoryBroker, MemoryConsumer, MemoryProducer};
pub use producer::ProducerClient;
pub use record::{OutboundRecord, PartitionId, Record, TopicPartition};
