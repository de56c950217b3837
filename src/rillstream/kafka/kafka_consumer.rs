use crate::rillstream::kafka::actor::ConsumerActor;
use crate::rillstream::kafka::client::{
    ConsumerClient, OffsetMap, RdKafkaConsumerClient, TopicPartition,
};
use crate::rillstream::kafka::commit::CommitHandle;
use crate::rillstream::kafka::consumer_config::ConsumerConfig;
use crate::rillstream::kafka::handle::ConsumerHandle;
use crate::rillstream::kafka::kafka_error::ConsumerError;
use crate::rillstream::kafka::lifecycle::{shutdown_channel, Lifecycle, ShutdownToken};
use crate::rillstream::kafka::message::CommittableMessage;
use crate::rillstream::kafka::partition_stream::{PartitionStream, PartitionStreamFactory};
use crate::rillstream::kafka::poll_scheduler;
use crate::rillstream::kafka::requests::{AckSink, CommitMode, Request, StreamId};
use crate::rillstream::kafka::serialization::Serde;
use crate::rillstream::kafka::streams;
use futures::Stream;
use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// A streaming Kafka consumer with typed keys and values.
///
/// One internal actor task owns the (non-thread-safe) client and serves all
/// poll, fetch, commit, subscription and rebalance traffic; a scheduler task
/// keeps polls flowing while the consumer is idle. Records reach user code
/// through backpressured per-partition streams.
///
/// Consuming the same consumer's top-level streams from more than one place
/// concurrently is unsupported: records for a partition are handed to each
/// waiting stream, so multiple subscribers see duplicate delivery.
///
/// # Examples
///
/// ```rust,no_run
/// use rillstream::{KafkaConsumer, JsonSerializer};
/// use futures::StreamExt;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let consumer = KafkaConsumer::<String, String, _, _>::new(
///         "localhost:9092",
///         "my-group",
///         JsonSerializer,
///         JsonSerializer,
///     )?;
///     consumer.subscribe(&["my-topic"]).await?;
///
///     let mut records = consumer.stream();
///     while let Some(record) = records.next().await {
///         let record = record?;
///         println!("{}-{}@{}", record.topic(), record.partition(), record.offset());
///         record.committable_offset().commit().await?;
///     }
///     Ok(())
/// }
/// ```
pub struct KafkaConsumer<K, V, KS, VS, C = RdKafkaConsumerClient>
where
    KS: Serde<K>,
    VS: Serde<V>,
    C: ConsumerClient,
{
    handle: ConsumerHandle<C>,
    requests: mpsc::UnboundedSender<Request>,
    lifecycle: Lifecycle,
    shutdown: ShutdownToken,
    committer: CommitHandle,
    key_serde: Arc<KS>,
    value_serde: Arc<VS>,
    max_prefetch_batches: usize,
    next_stream_id: AtomicU64,
    group_id: String,
    _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KS, VS> KafkaConsumer<K, V, KS, VS, RdKafkaConsumerClient>
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    /// Creates a consumer against the given brokers with default
    /// configuration. Must be called from within a tokio runtime.
    pub fn new(
        brokers: &str,
        group_id: &str,
        key_serde: KS,
        value_serde: VS,
    ) -> Result<Self, ConsumerError> {
        Self::with_config(ConsumerConfig::new(brokers, group_id), key_serde, value_serde)
    }

    /// Creates a consumer with custom configuration.
    pub fn with_config(
        config: ConsumerConfig,
        key_serde: KS,
        value_serde: VS,
    ) -> Result<Self, ConsumerError> {
        let client = RdKafkaConsumerClient::from_config(&config)?;
        Ok(Self::with_client(client, config, key_serde, value_serde))
    }
}

impl<K, V, KS, VS, C> KafkaConsumer<K, V, KS, VS, C>
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
    C: ConsumerClient,
{
    /// Creates a consumer over an arbitrary client implementation. Used by
    /// tests and embeddings that bring their own transport.
    pub fn with_client(client: C, config: ConsumerConfig, key_serde: KS, value_serde: VS) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (polls_tx, polls_rx) = mpsc::channel(1);
        let handle = ConsumerHandle::new(client);
        let (shutdown_tx, shutdown_token) = shutdown_channel();

        let actor = ConsumerActor::new(
            handle.clone(),
            requests_rx,
            requests_tx.clone(),
            polls_rx,
            &config,
        );
        let actor_task = tokio::spawn(actor.run(shutdown_token.clone()));
        let scheduler_task = tokio::spawn(poll_scheduler::run(
            polls_tx,
            config.poll_interval,
            shutdown_token.clone(),
        ));
        let lifecycle = Lifecycle::supervise(shutdown_tx, actor_task, scheduler_task);
        let committer = CommitHandle::new(requests_tx.clone(), lifecycle.termination_watch());

        Self {
            handle,
            requests: requests_tx,
            lifecycle,
            shutdown: shutdown_token,
            committer,
            key_serde: Arc::new(key_serde),
            value_serde: Arc::new(value_serde),
            max_prefetch_batches: config.max_prefetch_batches.max(1),
            next_stream_id: AtomicU64::new(0),
            group_id: config.group_id,
            _phantom: PhantomData,
        }
    }

    /// Subscribe to the given topics.
    pub async fn subscribe(&self, topics: &[&str]) -> Result<(), ConsumerError> {
        if topics.is_empty() {
            return Err(ConsumerError::Config(
                "subscribe requires at least one topic".to_string(),
            ));
        }
        let topics: Vec<String> = topics.iter().map(|t| t.to_string()).collect();
        self.request_ack(|sink| Request::SubscribeTopics { topics, sink })
            .await
    }

    /// Subscribe to all topics matching a regex pattern.
    pub async fn subscribe_pattern(&self, pattern: &str) -> Result<(), ConsumerError> {
        if pattern.is_empty() {
            return Err(ConsumerError::Config(
                "subscribe requires a non-empty pattern".to_string(),
            ));
        }
        let pattern = pattern.to_string();
        self.request_ack(|sink| Request::SubscribePattern { pattern, sink })
            .await
    }

    /// Manually assign a fixed set of partitions, bypassing the group
    /// coordinator.
    pub async fn assign(&self, tps: Vec<TopicPartition>) -> Result<(), ConsumerError> {
        if tps.is_empty() {
            return Err(ConsumerError::Config(
                "assign requires at least one partition".to_string(),
            ));
        }
        self.request_ack(|sink| Request::Assign { tps, sink }).await
    }

    /// Manually assign every partition of a topic.
    pub async fn assign_topic(&self, topic: &str) -> Result<(), ConsumerError> {
        let partitions = self.partitions_for(topic).await?;
        let tps = partitions
            .into_iter()
            .map(|p| TopicPartition::new(topic, p))
            .collect();
        self.assign(tps).await
    }

    /// Drop the current subscription or manual assignment.
    pub async fn unsubscribe(&self) -> Result<(), ConsumerError> {
        self.request_ack(|sink| Request::Unsubscribe { sink }).await
    }

    /// Current assignment snapshot.
    pub async fn assignment(&self) -> Result<BTreeSet<TopicPartition>, ConsumerError> {
        let (sink, done) = oneshot::channel();
        self.requests
            .send(Request::Assignment {
                stream_id: self.next_stream_id(),
                listener: None,
                sink,
            })
            .map_err(|_| ConsumerError::Shutdown)?;
        let reply = done.await.map_err(|_| ConsumerError::Shutdown)?;
        Ok(reply.assigned.into_iter().map(|(tp, _)| tp).collect())
    }

    /// Merged stream of committable records across all assigned partitions.
    /// Per-partition offset order is preserved; cross-partition order is not.
    pub fn stream(
        &self,
    ) -> impl Stream<Item = Result<CommittableMessage<K, V>, ConsumerError>> + Send {
        streams::merged_stream(self.stream_factory(), self.next_stream_id())
    }

    /// Stream of per-partition record streams, one per assigned partition
    /// incarnation.
    pub fn partitioned_stream(
        &self,
    ) -> impl Stream<Item = PartitionStream<K, V, KS, VS>> + Send {
        streams::partitioned_stream(self.stream_factory(), self.next_stream_id())
    }

    /// Stream of assignment maps from partitions to their record streams.
    /// Each emission after the first carries only newly assigned partitions.
    pub fn partitions_map_stream(
        &self,
    ) -> impl Stream<Item = BTreeMap<TopicPartition, PartitionStream<K, V, KS, VS>>> + Send {
        streams::partitions_map_stream(self.stream_factory(), self.next_stream_id())
    }

    /// Stream of distinct assignment snapshots, starting with the current
    /// one.
    pub fn assignment_stream(&self) -> impl Stream<Item = BTreeSet<TopicPartition>> + Send {
        streams::assignment_stream(self.requests.clone(), self.next_stream_id())
    }

    /// Commit offsets, suspending until the broker acknowledges.
    pub async fn commit_sync(&self, offsets: OffsetMap) -> Result<(), ConsumerError> {
        self.committer.commit(offsets, CommitMode::Sync).await
    }

    /// Commit offsets through the client's asynchronous commit path.
    /// Completion still means broker acknowledgement.
    pub async fn commit_async(&self, offsets: OffsetMap) -> Result<(), ConsumerError> {
        self.committer.commit(offsets, CommitMode::Async).await
    }

    /// Seek the partition to the given offset.
    pub async fn seek(&self, tp: TopicPartition, offset: i64) -> Result<(), ConsumerError> {
        self.client_call(move |c| c.seek(&tp, offset)).await
    }

    /// Seek the given partitions to their first available offset.
    pub async fn seek_to_beginning(&self, tps: Vec<TopicPartition>) -> Result<(), ConsumerError> {
        self.client_call(move |c| c.seek_to_beginning(&tps)).await
    }

    /// Seek the given partitions past their last offset.
    pub async fn seek_to_end(&self, tps: Vec<TopicPartition>) -> Result<(), ConsumerError> {
        self.client_call(move |c| c.seek_to_end(&tps)).await
    }

    /// Next offset that will be fetched for the partition.
    pub async fn position(&self, tp: TopicPartition) -> Result<i64, ConsumerError> {
        self.client_call(move |c| c.position(&tp)).await
    }

    /// Partition ids of a topic.
    pub async fn partitions_for(&self, topic: &str) -> Result<Vec<i32>, ConsumerError> {
        let topic = topic.to_string();
        self.client_call(move |c| c.partitions_for(&topic)).await
    }

    /// First available offset per partition.
    pub async fn beginning_offsets(
        &self,
        tps: Vec<TopicPartition>,
    ) -> Result<BTreeMap<TopicPartition, i64>, ConsumerError> {
        self.client_call(move |c| c.beginning_offsets(&tps)).await
    }

    /// High watermark per partition.
    pub async fn end_offsets(
        &self,
        tps: Vec<TopicPartition>,
    ) -> Result<BTreeMap<TopicPartition, i64>, ConsumerError> {
        self.client_call(move |c| c.end_offsets(&tps)).await
    }

    /// Latest raw statistics payload from the client, if any.
    pub async fn metrics(&self) -> Result<Option<String>, ConsumerError> {
        self.handle.blocking(|c| c.metrics()).await
    }

    /// Stop consuming records. Assignment streams terminate and partition
    /// streams drain and end, but in-flight commits still complete and the
    /// consumer stays alive until [`terminate`](Self::terminate).
    pub fn stop_consuming(&self) -> Result<(), ConsumerError> {
        self.requests
            .send(Request::StopConsuming)
            .map_err(|_| ConsumerError::Shutdown)
    }

    /// Cancel the actor and scheduler, release the client, and wait for
    /// teardown.
    pub async fn terminate(&self) -> Result<(), ConsumerError> {
        self.lifecycle.terminate().await
    }

    /// Wait until the consumer terminates, surfacing an actor failure.
    pub async fn await_termination(&self) -> Result<(), ConsumerError> {
        self.lifecycle.await_termination().await
    }

    /// Consumer group ID
    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    async fn request_ack<F>(&self, make: F) -> Result<(), ConsumerError>
    where
        F: FnOnce(AckSink) -> Request,
    {
        let (sink, done) = oneshot::channel();
        self.requests
            .send(make(sink))
            .map_err(|_| ConsumerError::Shutdown)?;
        done.await.map_err(|_| ConsumerError::Shutdown)?
    }

    /// Operations documented as safe while the actor is polling still go
    /// through the shared handle, because the client itself is not
    /// thread-safe.
    async fn client_call<T, F>(&self, op: F) -> Result<T, ConsumerError>
    where
        F: FnOnce(&mut C) -> Result<T, rdkafka::error::KafkaError> + Send + 'static,
        T: Send + 'static,
    {
        self.handle
            .blocking(op)
            .await
            .and_then(|r| r.map_err(ConsumerError::from))
    }

    fn stream_factory(&self) -> PartitionStreamFactory<K, V, KS, VS> {
        PartitionStreamFactory {
            requests: self.requests.clone(),
            shutdown: self.shutdown.clone(),
            committer: self.committer.clone(),
            key_serde: Arc::clone(&self.key_serde),
            value_serde: Arc::clone(&self.value_serde),
            max_prefetch_batches: self.max_prefetch_batches,
            _phantom: PhantomData,
        }
    }

    fn next_stream_id(&self) -> StreamId {
        StreamId(self.next_stream_id.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl<K, V, KS, VS, C> Drop for KafkaConsumer<K, V, KS, VS, C>
where
    KS: Serde<K>,
    VS: Serde<V>,
    C: ConsumerClient,
{
    fn drop(&mut self) {
        self.lifecycle.signal_shutdown();
    }
}

/// Builder for creating a [`KafkaConsumer`] with configuration options.
///
/// # Examples
///
/// ```rust,no_run
/// use rillstream::{ConsumerBuilder, ConsumerConfig, JsonSerializer};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let consumer = ConsumerBuilder::<String, String, _, _>::new(
///         "localhost:9092",
///         "my-group",
///         JsonSerializer,
///         JsonSerializer,
///     )
///     .config(
///         ConsumerConfig::new("localhost:9092", "my-group")
///             .poll_interval(Duration::from_millis(25))
///             .max_prefetch_batches(4),
///     )
///     .build()?;
///     consumer.subscribe(&["my-topic"]).await?;
///     Ok(())
/// }
/// ```
pub struct ConsumerBuilder<K, V, KS, VS>
where
    KS: Serde<K>,
    VS: Serde<V>,
{
    config: ConsumerConfig,
    key_serde: KS,
    value_serde: VS,
    _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KS, VS> ConsumerBuilder<K, V, KS, VS>
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    /// Creates a new builder with required parameters
    pub fn new(brokers: &str, group_id: &str, key_serde: KS, value_serde: VS) -> Self {
        Self {
            config: ConsumerConfig::new(brokers, group_id),
            key_serde,
            value_serde,
            _phantom: PhantomData,
        }
    }

    /// Replaces the full consumer configuration
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds an rdkafka-backed consumer
    pub fn build(self) -> Result<KafkaConsumer<K, V, KS, VS>, ConsumerError> {
        KafkaConsumer::with_config(self.config, self.key_serde, self.value_serde)
    }

    /// Builds a consumer over a custom client implementation
    pub fn build_with_client<C: ConsumerClient>(self, client: C) -> KafkaConsumer<K, V, KS, VS, C> {
        KafkaConsumer::with_client(client, self.config, self.key_serde, self.value_serde)
    }
}
