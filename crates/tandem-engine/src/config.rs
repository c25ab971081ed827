use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tandem_client::ClientConfig;

/// Configuration for a [`StateAndEventEngine`](crate::StateAndEventEngine)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Consumer group shared by all workers of one processing workload
    pub group_id: String,

    /// Partitioned event log
    pub event_topic: String,

    /// Compacted state log, co-partitioned with `event_topic`
    pub state_topic: String,

    /// Upper bound on one poll of either log
    pub poll_timeout_ms: u64,

    /// Upper bound on closing one log client
    pub close_timeout_ms: u64,

    /// Retries for a transiently failing subscribe
    pub subscribe_retries: u32,

    /// Retries for a transiently failing offset commit
    pub commit_retries: u32,

    /// Retries for a transiently failing publish
    pub send_retries: u32,

    /// Consecutive transiently failing polls tolerated
    pub poll_retries: u32,

    /// Initial retry backoff
    pub retry_initial_delay_ms: u64,

    /// Maximum retry backoff
    pub retry_max_delay_ms: u64,

    /// Refuse to start when event and state topics differ in partition count
    pub validate_partition_counts: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            event_topic: String::new(),
            state_topic: String::new(),
            poll_timeout_ms: 100,
            close_timeout_ms: 5_000,
            subscribe_retries: 3,
            commit_retries: 3,
            send_retries: 3,
            poll_retries: 10,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            validate_partition_counts: true,
        }
    }
}

impl EngineConfig {
    /// Create a configuration for one event/state topic pair
    pub fn new(
        group_id: impl Into<String>,
        event_topic: impl Into<String>,
        state_topic: impl Into<String>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            event_topic: event_topic.into(),
            state_topic: state_topic.into(),
            ..Self::default()
        }
    }

    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Retry and timeout settings for the engine's log clients
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig::builder()
            .subscribe_retries(self.subscribe_retries)
            .commit_retries(self.commit_retries)
            .send_retries(self.send_retries)
            .poll_retries(self.poll_retries)
            .close_timeout(self.close_timeout())
            .retry_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .retry_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .build()
    }

    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            return Err(EngineError::InvalidConfig("group_id must not be empty".into()));
        }
        if self.event_topic.is_empty() || self.state_topic.is_empty() {
            return Err(EngineError::InvalidConfig(
                "event_topic and state_topic must not be empty".into(),
            ));
        }
        if self.event_topic == self.state_topic {
            return Err(EngineError::InvalidConfig(format!(
                "event and state topic must differ (both are {})",
                self.event_topic
            )));
        }
        if self.poll_timeout_ms == 0 {
            return Err(EngineError::InvalidConfig(
                "poll_timeout_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`EngineConfig`]
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn group_id(mut self, group_id: impl Into<String>) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn event_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.event_topic = topic.into();
        self
    }

    pub fn state_topic(mut self, topic: impl Into<String>) -> Self {
        self.config.state_topic = topic.into();
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.config.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn subscribe_retries(mut self, retries: u32) -> Self {
        self.config.subscribe_retries = retries;
        self
    }

    pub fn commit_retries(mut self, retries: u32) -> Self {
        self.config.commit_retries = retries;
        self
    }

    pub fn send_retries(mut self, retries: u32) -> Self {
        self.config.send_retries = retries;
        self
    }

    pub fn poll_retries(mut self, retries: u32) -> Self {
        self.config.poll_retries = retries;
        self
    }

    pub fn retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.config.retry_initial_delay_ms = initial.as_millis() as u64;
        self.config.retry_max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn validate_partition_counts(mut self, enabled: bool) -> Self {
        self.config.validate_partition_counts = enabled;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}
