//! Streaming Kafka consumer library
//!
//! This library turns a single blocking Kafka client handle into a family of
//! backpressured, partition-aware record streams with correct cooperative
//! rebalance handling and broker-acknowledged offset commits.

// Export the rillstream.kafka module structure
pub mod rillstream;

// Re-export main API
pub use rillstream::kafka::{
    offsets_batch, BytesSerializer, CommitError, CommitMode, CommitRecovery, CommittableMessage,
    CommittableOffset, ConsumerBuilder, ConsumerClient, ConsumerConfig, ConsumerError, Headers,
    JsonSerializer, KafkaConsumer, Message, OffsetAndMetadata, OffsetMap, PartitionStream,
    PollOutcome, RawRecord, RebalanceEvent, SerializationError, Serde, StringSerializer,
    TopicPartition,
};
