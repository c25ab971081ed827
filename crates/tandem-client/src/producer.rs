//! Retry-aware producer wrapper.

use crate::backend::LogProducer;
use crate::config::ClientConfig;
use crate::error::{BackendError, Error, Result};
use crate::record::OutboundRecord;
use tracing::{debug, error, info, warn};

/// Retry-aware access to one producer of the partitioned log.
pub struct ProducerClient {
    name: String,
    backend: Box<dyn LogProducer>,
    config: ClientConfig,
    closed: bool,
}

impl ProducerClient {
    pub fn new(name: impl Into<String>, backend: Box<dyn LogProducer>, config: ClientConfig) -> Self {
        Self {
            name: name.into(),
            backend,
            config,
            closed: false,
        }
    }

    /// Publish `records` as one batch.
    ///
    /// Transient failures are retried up to `send_retries` times. A retried
    /// batch may be written twice; consumers of these records must tolerate
    /// duplicates.
    pub async fn send(&mut self, records: Vec<OutboundRecord>) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        if self.closed {
            return Err(Error::Fatal {
                operation: "send",
                source: BackendError::Closed,
            });
        }

        let count = records.len();
        let mut attempt = 0u32;
        loop {
            match self.backend.send(records.clone()).await {
                Ok(()) => {
                    debug!(client = %self.name, count, "Records sent");
                    return Ok(());
                }
                Err(e) if e.is_retriable() && attempt < self.config.send_retries => {
                    attempt += 1;
                    warn!(
                        client = %self.name,
                        count,
                        attempt,
                        max_retries = self.config.send_retries,
                        error = %e,
                        "Send failed, retrying"
                    );
                    tokio::time::sleep(self.config.delay_for_attempt(attempt)).await;
                }
                Err(source) => {
                    let err = if source.is_retriable() {
                        Error::RetriesExhausted {
                            operation: "send",
                            attempts: attempt + 1,
                            source,
                        }
                    } else {
                        Error::Fatal {
                            operation: "send",
                            source,
                        }
                    };
                    error!(client = %self.name, error = %err, "Fatal producer error");
                    return Err(err);
                }
            }
        }
    }

    /// Close the producer. Bounded, never fails, idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        match tokio::time::timeout(self.config.close_timeout, self.backend.close()).await {
            Ok(Ok(())) => info!(client = %self.name, "Producer closed"),
            Ok(Err(e)) => warn!(client = %self.name, error = %e, "Error closing producer"),
            Err(_) => warn!(
                client = %self.name,
                timeout_ms = self.config.close_timeout.as_millis() as u64,
                "Timed out closing producer"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LogMetadata;
    use crate::memory::{FaultOp, MemoryBroker};
    use crate::record::TopicPartition;
    use std::time::Duration;

    fn fast_config() -> ClientConfig {
        ClientConfig::builder()
            .retry_initial_delay(Duration::from_millis(1))
            .retry_max_delay(Duration::from_millis(2))
            .send_retries(1)
            .build()
    }

    #[tokio::test]
    async fn test_send_retries_transient_failure() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 2, false).unwrap();
        let mut producer = ProducerClient::new("out", Box::new(broker.producer()), fast_config());

        broker.inject_fault(FaultOp::Send, BackendError::Broker("not leader".into()));
        producer
            .send(vec![OutboundRecord::new("out", "k", "v").with_partition(1)])
            .await
            .unwrap();

        assert_eq!(broker.end_offset(&TopicPartition::new("out", 1)).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_send_unknown_topic_is_fatal() {
        let broker = MemoryBroker::new();
        let mut producer = ProducerClient::new("out", Box::new(broker.producer()), fast_config());

        let err = producer
            .send(vec![OutboundRecord::new("missing", "k", "v")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Fatal {
                source: BackendError::UnknownTopic(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let broker = MemoryBroker::new();
        broker.create_topic("out", 1, false).unwrap();
        let mut producer = ProducerClient::new("out", Box::new(broker.producer()), fast_config());

        producer.close().await;
        let err = producer
            .send(vec![OutboundRecord::new("out", "k", "v")])
            .await
            .unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_bounded_when_backend_hangs() {
        let broker = MemoryBroker::new();
        let config = ClientConfig::builder()
            .close_timeout(Duration::from_millis(500))
            .build();
        let mut producer = ProducerClient::new("out", Box::new(broker.producer()), config);

        broker.inject_stall(FaultOp::Close);
        let start = tokio::time::Instant::now();
        producer.close().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1000));
    }
}
