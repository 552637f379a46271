//! Configuration for the sync engine.

use std::time::Duration;

/// Queue items abandoned after this many counted failures.
pub const MAX_RETRIES: u32 = 5;

/// Items pulled from the store per bulk pass.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Configuration for sync passes.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum number of queue items processed by one `sync_all`.
    pub batch_size: usize,
    /// Retry configuration.
    pub retry: RetryConfig,
    /// Timeout for a single remote write.
    pub request_timeout: Duration,
    /// Capacity of the engine event channel.
    pub event_capacity: usize,
}

impl SyncConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            retry: RetryConfig::default(),
            request_timeout: Duration::from_secs(30),
            event_capacity: 256,
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the event channel capacity.
    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Counted failures after which an item is abandoned.
    pub max_retries: u32,
    /// Unit of the exponential backoff.
    pub base_delay: Duration,
    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration abandoning after `max_retries`.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
        }
    }

    /// Sets the backoff unit.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Delay before the retry following `retry_count` counted failures:
    /// `base * 2^(retry_count + 1)`, capped at `max_delay`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_count.saturating_add(1));
        factor
            .and_then(|f| self.base_delay.checked_mul(f))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(MAX_RETRIES)
    }
}
