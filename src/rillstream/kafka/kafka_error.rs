//! Consumer error types

use crate::rillstream::kafka::serialization::SerializationError;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use std::error::Error;
use std::fmt;

/// Error returned by consumer operations.
#[derive(Debug, Clone)]
pub enum ConsumerError {
    /// Underlying Kafka client error
    Kafka(KafkaError),
    /// Record-level deserialization failure
    Serialization(SerializationError),
    /// Broker rejected an offset commit
    Commit(CommitError),
    /// The consumer terminated before the operation completed
    Shutdown,
    /// Timed out waiting for a message
    Timeout,
    /// Record carried no payload
    NoMessage,
    /// Invalid configuration
    Config(String),
}

impl fmt::Display for ConsumerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsumerError::Kafka(err) => write!(f, "Kafka error: {}", err),
            ConsumerError::Serialization(err) => write!(f, "Serialization error: {}", err),
            ConsumerError::Commit(err) => write!(f, "Commit error: {}", err),
            ConsumerError::Shutdown => write!(f, "Consumer has been terminated"),
            ConsumerError::Timeout => write!(f, "Timeout waiting for message"),
            ConsumerError::NoMessage => write!(f, "No message available"),
            ConsumerError::Config(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl Error for ConsumerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ConsumerError::Kafka(err) => Some(err),
            ConsumerError::Serialization(err) => Some(err),
            ConsumerError::Commit(err) => Some(err),
            _ => None,
        }
    }
}

impl From<KafkaError> for ConsumerError {
    fn from(err: KafkaError) -> Self {
        ConsumerError::Kafka(err)
    }
}

impl From<SerializationError> for ConsumerError {
    fn from(err: SerializationError) -> Self {
        ConsumerError::Serialization(err)
    }
}

impl From<CommitError> for ConsumerError {
    fn from(err: CommitError) -> Self {
        ConsumerError::Commit(err)
    }
}

/// Broker rejection of an offset commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitError {
    /// The broker refused the commit; `retriable` reflects whether a later
    /// attempt with the same offsets may succeed (rebalance in progress,
    /// coordinator loading).
    Rejected { reason: String, retriable: bool },
    /// The commit did not complete within the configured commit timeout
    TimedOut,
}

impl CommitError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, CommitError::Rejected { retriable: true, .. })
    }

    /// Classifies a client error into a commit rejection.
    pub fn from_kafka(err: &KafkaError) -> Self {
        let retriable = matches!(
            err.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::RebalanceInProgress
                    | RDKafkaErrorCode::CoordinatorLoadInProgress
                    | RDKafkaErrorCode::CoordinatorNotAvailable
                    | RDKafkaErrorCode::NotCoordinator
                    | RDKafkaErrorCode::RequestTimedOut
            )
        );
        CommitError::Rejected {
            reason: err.to_string(),
            retriable,
        }
    }
}

impl fmt::Display for CommitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommitError::Rejected { reason, retriable } => {
                write!(f, "commit rejected (retriable={}): {}", retriable, reason)
            }
            CommitError::TimedOut => write!(f, "commit timed out"),
        }
    }
}

impl Error for CommitError {}
