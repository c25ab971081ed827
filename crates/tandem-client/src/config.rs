use std::time::Duration;

/// Retry and timeout settings for one log client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Retries after the first failed subscribe attempt
    pub subscribe_retries: u32,
    /// Retries after the first failed commit attempt
    pub commit_retries: u32,
    /// Retries after the first failed send attempt
    pub send_retries: u32,
    /// Consecutive transiently failed polls tolerated before escalating
    pub poll_retries: u32,
    /// Upper bound on `close()`
    pub close_timeout: Duration,
    /// Initial delay between retries
    pub retry_initial_delay: Duration,
    /// Maximum delay between retries
    pub retry_max_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            subscribe_retries: 3,
            commit_retries: 3,
            send_retries: 3,
            poll_retries: 10,
            close_timeout: Duration::from_secs(5),
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Backoff before retry number `attempt` (1-indexed). Doubles per attempt,
    /// capped at `retry_max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(30);
        let delay = self
            .retry_initial_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        delay.min(self.retry_max_delay)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
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

    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.config.retry_initial_delay = delay;
        self
    }

    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.config.retry_max_delay = delay;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
