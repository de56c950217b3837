// Consumer engine modules
mod actor;
mod handle;
mod kafka_consumer;
mod partition_stream;
mod poll_scheduler;
mod requests;
mod streams;

// Common types
pub mod client;
pub mod commit;
pub mod headers;
mod lifecycle;
pub mod message;

// Configuration modules
pub mod client_config_builder;
pub mod common_config;
pub mod consumer_config;
pub mod kafka_error;
pub mod serialization;

// Shared utilities
mod utils;

// Re-export main API
pub use client::{
    ConsumerClient, OffsetAndMetadata, OffsetMap, PollOutcome, RawRecord, RdKafkaConsumerClient,
    RebalanceEvent, TopicPartition,
};
pub use commit::{offsets_batch, CommittableOffset};
pub use consumer_config::{CommitRecovery, ConsumerConfig, IsolationLevel, OffsetReset};
pub use headers::Headers;
pub use kafka_consumer::{ConsumerBuilder, KafkaConsumer};
pub use kafka_error::{CommitError, ConsumerError};
pub use message::{CommittableMessage, Message};
pub use partition_stream::PartitionStream;
pub use requests::{CommitMode, FetchReason};
pub use serialization::{
    from_json, to_json, BytesSerializer, JsonSerializer, SerializationError, Serde,
    StringSerializer,
};
pub use utils::convert_kafka_log_level;
