//! The blocking Kafka client seam.
//!
//! `ConsumerClient` is the narrow, synchronous interface the consumer engine
//! drives. The production implementation wraps rdkafka's `BaseConsumer`;
//! tests substitute an in-memory client. Every call is blocking and happens
//! under the consumer handle's mutex: the underlying client is not
//! thread-safe.

use crate::rillstream::kafka::client_config_builder::ClientConfigBuilder;
use crate::rillstream::kafka::consumer_config::ConsumerConfig;
use crate::rillstream::kafka::headers::Headers;
use crate::rillstream::kafka::kafka_error::CommitError;
use crate::rillstream::kafka::utils::convert_kafka_log_level;
use rdkafka::config::RDKafkaLogLevel;
use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::Message as KafkaMessage;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identifier of one log within a Kafka topic.
///
/// Ordered lexicographically by topic, then numerically by partition, so
/// iteration over sorted collections is stable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl std::fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.topic, self.partition)
    }
}

/// Offset plus optional commit metadata, as submitted to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsetAndMetadata {
    pub offset: i64,
    pub metadata: Option<String>,
}

impl OffsetAndMetadata {
    pub fn new(offset: i64) -> Self {
        Self {
            offset,
            metadata: None,
        }
    }

    pub fn with_metadata(offset: i64, metadata: impl Into<String>) -> Self {
        Self {
            offset,
            metadata: Some(metadata.into()),
        }
    }
}

/// Map of offsets keyed by partition, the unit of a commit.
pub type OffsetMap = BTreeMap<TopicPartition, OffsetAndMetadata>;

/// One record as handed over by the client, before deserialization.
#[derive(Debug, Clone)]
pub struct RawRecord {
    pub tp: TopicPartition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
    pub headers: Headers,
}

/// Group membership transition reported by the client during a poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebalanceEvent {
    Assigned(BTreeSet<TopicPartition>),
    Revoked(BTreeSet<TopicPartition>),
}

/// Everything one client poll produced. Rebalance transitions are listed in
/// callback order and precede the records that arrived in the same poll.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub rebalances: Vec<RebalanceEvent>,
    pub records: Vec<RawRecord>,
}

/// Completion callback for an asynchronous commit. Invoked from inside a
/// later poll once the broker acknowledged or rejected the commit.
pub type CommitCallback = Box<dyn FnOnce(Result<(), CommitError>) + Send>;

/// Blocking Kafka client operations, as consumed by the consumer engine.
///
/// Implementations are not required to be thread-safe; all calls are
/// serialized by the consumer handle.
pub trait ConsumerClient: Send + 'static {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), KafkaError>;

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), KafkaError>;

    fn assign(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError>;

    fn unsubscribe(&mut self) -> Result<(), KafkaError>;

    /// Run one poll cycle, returning drained rebalance transitions and up to
    /// the client's record budget of records.
    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, KafkaError>;

    /// Initiate a commit. `done` fires once the broker responds; the
    /// response is surfaced by a subsequent `poll`.
    fn commit(&mut self, offsets: &OffsetMap, done: CommitCallback);

    fn pause(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError>;

    fn resume(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError>;

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError>;

    fn seek_to_beginning(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError>;

    fn seek_to_end(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError>;

    /// Next offset that will be fetched for the partition.
    fn position(&mut self, tp: &TopicPartition) -> Result<i64, KafkaError>;

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>, KafkaError>;

    fn beginning_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError>;

    fn end_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError>;

    /// Latest raw statistics payload emitted by the client, if any.
    fn metrics(&mut self) -> Option<String>;

    /// Release client resources. Idempotent; failures are swallowed by the
    /// caller.
    fn close(&mut self);
}

/// Callback inbox shared between the rdkafka client context and the wrapper.
///
/// librdkafka invokes rebalance and commit callbacks from inside `poll`;
/// the context pushes them here and `RdKafkaConsumerClient::poll` drains
/// them in order.
#[derive(Default)]
struct ContextInbox {
    rebalances: Mutex<VecDeque<RebalanceEvent>>,
    commit_callbacks: Mutex<VecDeque<CommitCallback>>,
    stats: Mutex<Option<String>>,
}

impl ContextInbox {
    fn push_rebalance(&self, event: RebalanceEvent) {
        if let Ok(mut queue) = self.rebalances.lock() {
            queue.push_back(event);
        }
    }

    fn drain_rebalances(&self) -> Vec<RebalanceEvent> {
        match self.rebalances.lock() {
            Ok(mut queue) => queue.drain(..).collect(),
            Err(_) => Vec::new(),
        }
    }
}

fn tpl_to_set(tpl: &TopicPartitionList) -> BTreeSet<TopicPartition> {
    tpl.elements()
        .iter()
        .map(|e| TopicPartition::new(e.topic(), e.partition()))
        .collect()
}

struct RillConsumerContext {
    inbox: Arc<ContextInbox>,
}

impl ClientContext for RillConsumerContext {
    fn log(&self, level: RDKafkaLogLevel, fac: &str, log_message: &str) {
        log::log!(
            target: "librdkafka",
            convert_kafka_log_level(level),
            "{} {}",
            fac,
            log_message
        );
    }

    fn stats_raw(&self, statistics: &[u8]) {
        if let Ok(mut stats) = self.inbox.stats.lock() {
            *stats = Some(String::from_utf8_lossy(statistics).into_owned());
        }
    }
}

impl ConsumerContext for RillConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                log::info!(
                    target: "consumer_client",
                    "rebalance: {} partition(s) being revoked",
                    tpl.count()
                );
                self.inbox
                    .push_rebalance(RebalanceEvent::Revoked(tpl_to_set(tpl)));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(msg) => {
                log::warn!(target: "consumer_client", "rebalance error: {}", msg);
            }
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            log::info!(
                target: "consumer_client",
                "rebalance: {} partition(s) assigned",
                tpl.count()
            );
            self.inbox
                .push_rebalance(RebalanceEvent::Assigned(tpl_to_set(tpl)));
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, _offsets: &TopicPartitionList) {
        let callback = match self.inbox.commit_callbacks.lock() {
            Ok(mut queue) => queue.pop_front(),
            Err(_) => None,
        };
        match callback {
            Some(done) => done(result.map_err(|e| CommitError::from_kafka(&e))),
            None => {
                log::warn!(target: "consumer_client", "commit callback with no pending commit")
            }
        }
    }
}

/// Production `ConsumerClient` over rdkafka's `BaseConsumer`.
///
/// The base consumer must be polled to make progress on rebalances, commit
/// callbacks and record delivery; the consumer actor is the only caller.
pub struct RdKafkaConsumerClient {
    consumer: BaseConsumer<RillConsumerContext>,
    inbox: Arc<ContextInbox>,
    request_timeout: Duration,
    max_poll_records: usize,
}

impl RdKafkaConsumerClient {
    /// Build a client from consumer configuration. Auto-commit is forced off:
    /// the commit pipeline owns offset commits.
    pub fn from_config(config: &ConsumerConfig) -> Result<Self, KafkaError> {
        let client_config = ClientConfigBuilder::new()
            .bootstrap_servers(&config.common.brokers)
            .client_id(config.common.client_id.as_deref())
            .request_timeout(config.common.request_timeout)
            .retry_backoff(config.common.retry_backoff)
            .property("group.id", &config.group_id)
            .property("auto.offset.reset", config.auto_offset_reset.as_str())
            .property("enable.auto.commit", "false")
            .property(
                "session.timeout.ms",
                config.session_timeout.as_millis().to_string(),
            )
            .property(
                "heartbeat.interval.ms",
                config.heartbeat_interval.as_millis().to_string(),
            )
            .property("isolation.level", config.isolation_level.as_str())
            .custom_properties(&config.common.custom_config)
            .build();

        let inbox = Arc::new(ContextInbox::default());
        let context = RillConsumerContext {
            inbox: Arc::clone(&inbox),
        };
        let consumer: BaseConsumer<RillConsumerContext> =
            client_config.create_with_context(context)?;

        Ok(Self {
            consumer,
            inbox,
            request_timeout: config.common.request_timeout,
            max_poll_records: config.max_poll_records,
        })
    }

    fn tps_to_tpl(tps: &[TopicPartition]) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::with_capacity(tps.len());
        for tp in tps {
            tpl.add_partition(&tp.topic, tp.partition);
        }
        tpl
    }

    fn record_from(msg: &rdkafka::message::BorrowedMessage<'_>) -> RawRecord {
        let headers = match msg.headers() {
            Some(kafka_headers) => Headers::from_rdkafka_headers(kafka_headers),
            None => Headers::new(),
        };
        let timestamp = match msg.timestamp() {
            rdkafka::Timestamp::NotAvailable => None,
            rdkafka::Timestamp::CreateTime(t) | rdkafka::Timestamp::LogAppendTime(t) => Some(t),
        };
        RawRecord {
            tp: TopicPartition::new(msg.topic(), msg.partition()),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            value: msg.payload().map(|v| v.to_vec()),
            timestamp,
            headers,
        }
    }
}

impl ConsumerClient for RdKafkaConsumerClient {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), KafkaError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), KafkaError> {
        // librdkafka treats topic names starting with '^' as regex patterns
        let pattern = if pattern.starts_with('^') {
            pattern.to_string()
        } else {
            format!("^{}", pattern)
        };
        self.consumer.subscribe(&[pattern.as_str()])
    }

    fn assign(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        self.consumer.assign(&Self::tps_to_tpl(tps))
    }

    fn unsubscribe(&mut self) -> Result<(), KafkaError> {
        self.consumer.unsubscribe();
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> Result<PollOutcome, KafkaError> {
        let mut records = Vec::new();
        let mut deadline_used = false;
        while records.len() < self.max_poll_records {
            let poll_timeout = if deadline_used {
                Duration::ZERO
            } else {
                deadline_used = true;
                timeout
            };
            match self.consumer.poll(poll_timeout) {
                Some(Ok(msg)) => records.push(Self::record_from(&msg)),
                Some(Err(e)) => {
                    // Drain what we have; callbacks already fired
                    return if records.is_empty() {
                        Err(e)
                    } else {
                        Ok(PollOutcome {
                            rebalances: self.inbox.drain_rebalances(),
                            records,
                        })
                    };
                }
                None => break,
            }
        }
        Ok(PollOutcome {
            rebalances: self.inbox.drain_rebalances(),
            records,
        })
    }

    fn commit(&mut self, offsets: &OffsetMap, done: CommitCallback) {
        let mut tpl = TopicPartitionList::with_capacity(offsets.len());
        for (tp, oam) in offsets {
            if let Err(e) =
                tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(oam.offset))
            {
                done(Err(CommitError::from_kafka(&e)));
                return;
            }
            if oam.metadata.is_some() {
                log::debug!(
                    target: "consumer_client",
                    "commit metadata for {} not forwarded to librdkafka",
                    tp
                );
            }
        }
        if let Ok(mut queue) = self.inbox.commit_callbacks.lock() {
            queue.push_back(done);
        }
        if let Err(e) = self
            .consumer
            .commit(&tpl, rdkafka::consumer::CommitMode::Async)
        {
            // The async commit never started, so its callback will not fire
            let callback = self
                .inbox
                .commit_callbacks
                .lock()
                .ok()
                .and_then(|mut q| q.pop_back());
            if let Some(done) = callback {
                done(Err(CommitError::from_kafka(&e)));
            }
        }
    }

    fn pause(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        self.consumer.pause(&Self::tps_to_tpl(tps))
    }

    fn resume(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        self.consumer.resume(&Self::tps_to_tpl(tps))
    }

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        self.consumer.seek(
            &tp.topic,
            tp.partition,
            Offset::Offset(offset),
            self.request_timeout,
        )
    }

    fn seek_to_beginning(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        for tp in tps {
            self.consumer.seek(
                &tp.topic,
                tp.partition,
                Offset::Beginning,
                self.request_timeout,
            )?;
        }
        Ok(())
    }

    fn seek_to_end(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        for tp in tps {
            self.consumer
                .seek(&tp.topic, tp.partition, Offset::End, self.request_timeout)?;
        }
        Ok(())
    }

    fn position(&mut self, tp: &TopicPartition) -> Result<i64, KafkaError> {
        let positions = self.consumer.position()?;
        match positions
            .find_partition(&tp.topic, tp.partition)
            .map(|e| e.offset())
        {
            Some(Offset::Offset(offset)) => Ok(offset),
            _ => Err(KafkaError::OffsetFetch(RDKafkaErrorCode::NoOffset)),
        }
    }

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>, KafkaError> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(topic), self.request_timeout)?;
        let topic_metadata = metadata
            .topics()
            .iter()
            .find(|t| t.name() == topic)
            .ok_or(KafkaError::MetadataFetch(
                RDKafkaErrorCode::UnknownTopicOrPartition,
            ))?;
        Ok(topic_metadata.partitions().iter().map(|p| p.id()).collect())
    }

    fn beginning_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError> {
        let mut offsets = BTreeMap::new();
        for tp in tps {
            let (low, _high) =
                self.consumer
                    .fetch_watermarks(&tp.topic, tp.partition, self.request_timeout)?;
            offsets.insert(tp.clone(), low);
        }
        Ok(offsets)
    }

    fn end_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError> {
        let mut offsets = BTreeMap::new();
        for tp in tps {
            let (_low, high) =
                self.consumer
                    .fetch_watermarks(&tp.topic, tp.partition, self.request_timeout)?;
            offsets.insert(tp.clone(), high);
        }
        Ok(offsets)
    }

    fn metrics(&mut self) -> Option<String> {
        self.inbox.stats.lock().ok().and_then(|s| s.clone())
    }

    fn close(&mut self) {
        self.consumer.unsubscribe();
    }
}
