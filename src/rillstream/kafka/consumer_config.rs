use crate::rillstream::kafka::common_config::CommonKafkaConfig;
use std::collections::HashMap;
use std::time::Duration;

/// Configuration for the streaming Kafka consumer with sensible defaults.
///
/// Beyond the usual group/session settings, the `poll_interval`,
/// `poll_timeout`, `max_prefetch_batches`, `commit_timeout` and
/// `commit_recovery` fields tune the consumer's internal record-fetch engine.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Common client configuration
    pub common: CommonKafkaConfig,
    /// Consumer group ID
    pub group_id: String,
    /// Auto offset reset behavior
    pub auto_offset_reset: OffsetReset,
    /// Session timeout
    pub session_timeout: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// Transaction isolation level
    pub isolation_level: IsolationLevel,
    /// Max records drained from the client per poll cycle
    pub max_poll_records: usize,
    /// Interval between scheduler-injected polls
    pub poll_interval: Duration,
    /// Per-poll client blocking bound
    pub poll_timeout: Duration,
    /// Prefetched record chunks held per partition stream; minimum 1.
    /// At 1 there is no prefetch: the next fetch is issued only after the
    /// delivered chunk has been taken, and the partition is paused while
    /// it has not.
    pub max_prefetch_batches: usize,
    /// Deadline for a single offset commit to be acknowledged
    pub commit_timeout: Duration,
    /// Retry policy for retriable commit failures
    pub commit_recovery: CommitRecovery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    /// Reset to earliest available offset
    Earliest,
    /// Reset to latest offset
    Latest,
    /// Fail if no initial offset exists
    None,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
            OffsetReset::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "read_uncommitted",
            IsolationLevel::ReadCommitted => "read_committed",
        }
    }
}

/// Policy for recovering from retriable commit failures (rebalance in
/// progress, coordinator movement).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitRecovery {
    /// Retry with linear backoff (`backoff * attempt`) up to `max_attempts`,
    /// then surface the original error to the caller.
    Default,
    /// Surface every commit failure directly to the caller.
    None,
}

impl CommitRecovery {
    pub(crate) const MAX_ATTEMPTS: u32 = 10;
    pub(crate) const BACKOFF_STEP: Duration = Duration::from_millis(10);

    pub(crate) fn should_retry(&self, attempt: u32) -> bool {
        matches!(self, CommitRecovery::Default) && attempt < Self::MAX_ATTEMPTS
    }

    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        Self::BACKOFF_STEP * attempt.max(1)
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            common: CommonKafkaConfig::default(),
            group_id: "default-group".to_string(),
            auto_offset_reset: OffsetReset::Earliest,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            isolation_level: IsolationLevel::ReadUncommitted,
            max_poll_records: 500,
            poll_interval: Duration::from_millis(50),
            poll_timeout: Duration::from_millis(50),
            max_prefetch_batches: 2,
            commit_timeout: Duration::from_secs(15),
            commit_recovery: CommitRecovery::Default,
        }
    }
}

impl ConsumerConfig {
    /// Create a new config with brokers and group ID
    pub fn new(brokers: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            common: CommonKafkaConfig::new(brokers),
            group_id: group_id.into(),
            ..Default::default()
        }
    }

    /// Set client ID
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.common = self.common.client_id(client_id);
        self
    }

    /// Set auto offset reset behavior
    pub fn auto_offset_reset(mut self, reset: OffsetReset) -> Self {
        self.auto_offset_reset = reset;
        self
    }

    /// Set session and heartbeat timeouts
    pub fn session_config(
        mut self,
        session_timeout: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        self.session_timeout = session_timeout;
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    /// Set transaction isolation level
    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    /// Set max records drained per poll cycle
    pub fn max_poll_records(mut self, max_records: usize) -> Self {
        self.max_poll_records = max_records;
        self
    }

    /// Set the interval between scheduler-injected polls
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the per-poll client blocking bound
    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set prefetch depth per partition stream; values below 1 are clamped.
    /// 1 disables prefetching entirely.
    pub fn max_prefetch_batches(mut self, batches: usize) -> Self {
        self.max_prefetch_batches = batches.max(1);
        self
    }

    /// Set the per-commit acknowledgement deadline
    pub fn commit_timeout(mut self, timeout: Duration) -> Self {
        self.commit_timeout = timeout;
        self
    }

    /// Set the commit retry policy
    pub fn commit_recovery(mut self, recovery: CommitRecovery) -> Self {
        self.commit_recovery = recovery;
        self
    }

    /// Set request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.common = self.common.request_timeout(timeout);
        self
    }

    /// Set retry backoff
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.common = self.common.retry_backoff(backoff);
        self
    }

    /// Add custom configuration property
    pub fn custom_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.common = self.common.custom_property(key, value);
        self
    }

    /// Add multiple custom properties
    pub fn custom_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.common = self.common.custom_properties(properties);
        self
    }

    /// Convenience accessor for the broker list
    pub fn brokers(&self) -> &str {
        &self.common.brokers
    }

    /// Preset optimized for continuous stream processing
    pub fn streaming(mut self) -> Self {
        self.poll_interval = Duration::from_millis(25);
        self.poll_timeout = Duration::from_millis(25);
        self.max_prefetch_batches = 4;
        self.max_poll_records = 100;
        self
    }

    /// Preset for minimal end-to-end latency
    pub fn low_latency(mut self) -> Self {
        self.poll_interval = Duration::from_millis(5);
        self.poll_timeout = Duration::from_millis(5);
        self.max_prefetch_batches = 2;
        self.heartbeat_interval = Duration::from_secs(1);
        self.session_timeout = Duration::from_secs(6);
        self
    }

    /// Preset for bulk throughput
    pub fn high_throughput(mut self) -> Self {
        self.max_poll_records = 2000;
        self.max_prefetch_batches = 8;
        self.poll_interval = Duration::from_millis(100);
        self = self.custom_property("fetch.min.bytes", "50000");
        self.custom_property("fetch.message.max.bytes", "2097152")
    }
}
