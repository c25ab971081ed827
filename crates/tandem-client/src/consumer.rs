//! Retry-aware consumer wrapper.
//!
//! [`ConsumerClient`] wraps a [`LogConsumer`] with:
//! - Timestamp-ordered batches from [`poll`](ConsumerClient::poll)
//! - Bounded retries for transient subscribe/commit failures
//! - Immediate escalation of illegal-state, bad-argument and auth failures
//! - Bounded, idempotent, never-failing [`close`](ConsumerClient::close)
//!
//! # Example
//!
//! ```rust,ignore
//! use tandem_client::{ClientConfig, ConsumerClient};
//!
//! let mut consumer = ConsumerClient::new("events", Box::new(backend), ClientConfig::default());
//! consumer.subscribe(&["events".to_string()], listener).await?;
//!
//! loop {
//!     for record in consumer.poll(Duration::from_millis(100)).await? {
//!         handle(&record)?;
//!         consumer.commit(&record).await?;
//!     }
//! }
//! ```

use crate::backend::{LogConsumer, RebalanceListener};
use crate::config::ClientConfig;
use crate::error::{BackendError, Error, Result};
use crate::record::{Record, TopicPartition};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Retry-aware access to one consumer of the partitioned log.
pub struct ConsumerClient {
    name: String,
    backend: Box<dyn LogConsumer>,
    config: ClientConfig,
    /// Consecutive transiently failed polls
    poll_failures: u32,
    closed: bool,
}

impl ConsumerClient {
    /// `name` only labels log lines.
    pub fn new(name: impl Into<String>, backend: Box<dyn LogConsumer>, config: ClientConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            config,
            poll_failures: 0,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join the consumer group for `topics`.
    ///
    /// Transient broker errors are retried up to `subscribe_retries` times;
    /// anything else fails immediately.
    pub async fn subscribe(
        &mut self,
        topics: &[String],
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            match self.backend.subscribe(topics, Arc::clone(&listener)).await {
                Ok(()) => {
                    info!(client = %self.name, topics = ?topics, "Subscribed");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < self.config.subscribe_retries => {
                    attempt += 1;
                    warn!(
                        client = %self.name,
                        attempt,
                        max_retries = self.config.subscribe_retries,
                        error = %e,
                        "Subscribe failed, retrying"
                    );
                    tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                }
                Err(e) => return Err(self.escalate("subscribe", attempt, e)),
            }
        }
    }

    /// Poll for at most one batch, sorted by record timestamp ascending.
    ///
    /// A transient failure is logged and yields an empty batch. More than
    /// `poll_retries` consecutive transient failures escalate to fatal.
    pub async fn poll(&mut self, timeout: Duration) -> Result<Vec<Record>> {
        match self.backend.poll(timeout).await {
            Ok(mut records) => {
                self.poll_failures = 0;
                // Stable: offset order is kept among equal timestamps.
                records.sort_by_key(|r| r.timestamp);
                if !records.is_empty() {
                    debug!(client = %self.name, count = records.len(), "Polled records");
                }
                Ok(records)
            }
            Err(e) if e.is_retriable() && self.poll_failures < self.config.poll_retries => {
                self.poll_failures += 1;
                warn!(
                    client = %self.name,
                    consecutive_failures = self.poll_failures,
                    error = %e,
                    "Poll failed, will poll again"
                );
                Ok(Vec::new())
            }
            Err(e) => {
                let attempts = self.poll_failures;
                self.poll_failures = 0;
                Err(self.escalate("poll", attempts, e))
            }
        }
    }

    /// Commit the offset following `record` for its partition.
    pub async fn commit(&mut self, record: &Record) -> Result<()> {
        let partition = record.topic_partition();
        let next_offset = record.offset + 1;
        let mut attempt = 0u32;
        loop {
            match self.backend.commit(&partition, next_offset).await {
                Ok(()) => {
                    debug!(client = %self.name, partition = %partition, offset = next_offset, "Offset committed");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < self.config.commit_retries => {
                    attempt += 1;
                    warn!(
                        client = %self.name,
                        partition = %partition,
                        offset = next_offset,
                        attempt,
                        max_retries = self.config.commit_retries,
                        error = %e,
                        "Commit failed, retrying"
                    );
                    tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                }
                Err(e) => return Err(self.escalate("commit", attempt, e)),
            }
        }
    }

    pub fn pause(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.backend
            .pause(partitions)
            .map_err(|e| Error::classify("pause", e))
    }

    pub fn resume(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.backend
            .resume(partitions)
            .map_err(|e| Error::classify("resume", e))
    }

    pub fn paused(&self) -> Vec<TopicPartition> {
        self.backend.paused()
    }

    pub fn assign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.backend
            .assign(partitions)
            .map_err(|e| Error::classify("assign", e))
    }

    pub fn unassign(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.backend
            .unassign(partitions)
            .map_err(|e| Error::classify("unassign", e))
    }

    pub fn seek(&mut self, partition: &TopicPartition, offset: u64) -> Result<()> {
        self.backend
            .seek(partition, offset)
            .map_err(|e| Error::classify("seek", e))
    }

    pub fn seek_to_beginning(&mut self, partitions: &[TopicPartition]) -> Result<()> {
        self.backend
            .seek_to_beginning(partitions)
            .map_err(|e| Error::classify("seek_to_beginning", e))
    }

    pub fn position(&self, partition: &TopicPartition) -> Option<u64> {
        self.backend.position(partition)
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.backend.assignment()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the consumer.
    ///
    /// Bounded by `close_timeout`. Failures are logged, never returned, and
    /// repeated calls are no-ops.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match tokio::time::timeout(self.config.close_timeout, self.backend.close()).await {
            Ok(Ok(())) => info!(client = %self.name, "Consumer closed"),
            Ok(Err(e)) => warn!(client = %self.name, error = %e, "Error closing consumer"),
            Err(_) => warn!(
                client = %self.name,
                timeout_ms = self.config.close_timeout.as_millis() as u64,
                "Timed out closing consumer"
            ),
        }
    }

    fn escalate(&self, operation: &'static str, attempts: u32, source: BackendError) -> Error {
        let err = if source.is_retriable() {
            Error::RetriesExhausted {
                operation,
                attempts: attempts + 1,
                source,
            }
        } else {
            Error::Fatal { operation, source }
        };
        error!(client = %self.name, error = %err, "Fatal consumer error");
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::PartitionControl;
    use crate::memory::{FaultOp, MemoryBroker};
    use crate::record::OutboundRecord;

    struct NoopListener;

    impl RebalanceListener for NoopListener {
        fn on_partitions_assigned(&self, _: &mut dyn PartitionControl, _: &[TopicPartition]) {}
        fn on_partitions_revoked(&self, _: &mut dyn PartitionControl, _: &[TopicPartition]) {}
    }

    fn fast_config() -> ClientConfig {
        ClientConfig::builder()
            .retry_initial_delay(Duration::from_millis(1))
            .retry_max_delay(Duration::from_millis(2))
            .commit_retries(2)
            .subscribe_retries(2)
            .poll_retries(2)
            .close_timeout(Duration::from_millis(200))
            .build()
    }

    fn client_for(broker: &MemoryBroker, group: &str) -> ConsumerClient {
        ConsumerClient::new(group, Box::new(broker.consumer(group)), fast_config())
    }

    #[tokio::test]
    async fn test_poll_sorts_by_timestamp() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        for (key, ts) in [("a", 30), ("b", 10), ("c", 20)] {
            broker
                .produce(OutboundRecord::new("events", key, "v").with_timestamp(ts))
                .unwrap();
        }

        let mut client = client_for(&broker, "g");
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        let records = client.poll(Duration::from_millis(50)).await.unwrap();

        let timestamps: Vec<i64> = records.iter().map(|r| r.timestamp).collect();
        assert_eq!(timestamps, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_commit_retries_transient_failures() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        broker
            .produce(OutboundRecord::new("events", "k", "v").with_partition(0))
            .unwrap();

        let mut client = client_for(&broker, "g");
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        let records = client.poll(Duration::from_millis(50)).await.unwrap();

        broker.inject_fault(FaultOp::Commit, BackendError::Timeout("slow".into()));
        broker.inject_fault(FaultOp::Commit, BackendError::Interrupted("wakeup".into()));
        client.commit(&records[0]).await.unwrap();

        assert_eq!(
            broker.committed_offset("g", &TopicPartition::new("events", 0)),
            Some(1)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_backs_off_between_attempts() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        broker
            .produce(OutboundRecord::new("events", "k", "v").with_partition(0))
            .unwrap();

        // Default backoff: 100ms, then 200ms.
        let mut client = ConsumerClient::new("g", Box::new(broker.consumer("g")), ClientConfig::default());
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        let records = client.poll(Duration::from_millis(50)).await.unwrap();

        broker.inject_fault(FaultOp::Commit, BackendError::Timeout("slow".into()));
        broker.inject_fault(FaultOp::Commit, BackendError::Timeout("slow".into()));
        let start = tokio::time::Instant::now();
        client.commit(&records[0]).await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_commit_escalates_after_retry_bound() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        broker
            .produce(OutboundRecord::new("events", "k", "v").with_partition(0))
            .unwrap();

        let mut client = client_for(&broker, "g");
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        let records = client.poll(Duration::from_millis(50)).await.unwrap();

        for _ in 0..3 {
            broker.inject_fault(FaultOp::Commit, BackendError::Timeout("slow".into()));
        }
        let err = client.commit(&records[0]).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(
            broker.committed_offset("g", &TopicPartition::new("events", 0)),
            None
        );
    }

    #[tokio::test]
    async fn test_commit_non_retriable_is_immediately_fatal() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        broker
            .produce(OutboundRecord::new("events", "k", "v").with_partition(0))
            .unwrap();

        let mut client = client_for(&broker, "g");
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();
        let records = client.poll(Duration::from_millis(50)).await.unwrap();

        broker.inject_fault(
            FaultOp::Commit,
            BackendError::Authorization("group access denied".into()),
        );
        // A second fault would be consumed by a retry; it must stay queued.
        broker.inject_fault(FaultOp::Commit, BackendError::Timeout("unused".into()));
        let err = client.commit(&records[0]).await.unwrap_err();
        assert!(matches!(err, Error::Fatal { operation: "commit", .. }));
        assert_eq!(broker.pending_faults(), 1);
    }

    #[tokio::test]
    async fn test_subscribe_retries_then_succeeds() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 2, false).unwrap();
        broker.inject_fault(FaultOp::Subscribe, BackendError::Broker("coordinator loading".into()));

        let mut client = client_for(&broker, "g");
        client
            .subscribe(&["events".to_string()], Arc::new(NoopListener))
            .await
            .unwrap();
        assert_eq!(broker.group_members("g").len(), 1);
    }

    #[tokio::test]
    async fn test_double_subscribe_is_fatal_without_retry() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();

        let mut client = client_for(&broker, "g");
        let topics = vec!["events".to_string()];
        client.subscribe(&topics, Arc::new(NoopListener)).await.unwrap();
        let err = client.subscribe(&topics, Arc::new(NoopListener)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Fatal {
                operation: "subscribe",
                source: BackendError::IllegalState(_)
            }
        ));
    }

    #[tokio::test]
    async fn test_poll_transient_failures_escalate() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        let mut client = client_for(&broker, "g");
        client.assign(&[TopicPartition::new("events", 0)]).unwrap();

        for _ in 0..3 {
            broker.inject_fault(FaultOp::Poll, BackendError::Timeout("fetch".into()));
        }
        assert!(client.poll(Duration::from_millis(5)).await.unwrap().is_empty());
        assert!(client.poll(Duration::from_millis(5)).await.unwrap().is_empty());
        let err = client.poll(Duration::from_millis(5)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_close_swallows_errors_and_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        let mut client = client_for(&broker, "g");

        broker.inject_fault(FaultOp::Close, BackendError::Broker("leave group failed".into()));
        client.close().await;
        assert!(client.is_closed());
        client.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_bounded_when_backend_hangs() {
        let broker = MemoryBroker::new();
        broker.create_topic("events", 1, false).unwrap();
        let mut client = client_for(&broker, "g");
        client
            .subscribe(&["events".to_string()], Arc::new(NoopListener))
            .await
            .unwrap();

        broker.inject_stall(FaultOp::Close);
        let start = tokio::time::Instant::now();
        client.close().await;

        // fast_config closes within 200ms.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_millis(400));
        assert!(client.is_closed());
    }
}
