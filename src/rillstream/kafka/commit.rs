//! User-facing offset commit coordination.

use crate::rillstream::kafka::client::{OffsetAndMetadata, OffsetMap, TopicPartition};
use crate::rillstream::kafka::kafka_error::ConsumerError;
use crate::rillstream::kafka::lifecycle::TerminationWatch;
use crate::rillstream::kafka::requests::{CommitMode, CommitRequest, Request};
use tokio::sync::{mpsc, oneshot};

/// Clonable entry point into the consumer's commit pipeline.
///
/// Wraps the caller's offset map in a commit request and races the actor's
/// completion against consumer termination: a successful return means the
/// broker acknowledged, a `Shutdown` error means the consumer went away
/// first.
#[derive(Debug, Clone)]
pub(crate) struct CommitHandle {
    requests: mpsc::UnboundedSender<Request>,
    termination: TerminationWatch,
}

impl CommitHandle {
    pub fn new(requests: mpsc::UnboundedSender<Request>, termination: TerminationWatch) -> Self {
        Self {
            requests,
            termination,
        }
    }

    pub async fn commit(&self, offsets: OffsetMap, mode: CommitMode) -> Result<(), ConsumerError> {
        let (sink, done) = oneshot::channel();
        self.requests
            .send(Request::Commit(CommitRequest {
                offsets,
                mode,
                attempt: 0,
                sink,
            }))
            .map_err(|_| ConsumerError::Shutdown)?;

        tokio::select! {
            completed = done => completed.map_err(|_| ConsumerError::Shutdown)?,
            terminated = self.termination.clone().wait() => {
                terminated?;
                Err(ConsumerError::Shutdown)
            }
        }
    }
}

/// Handle carried by every delivered record, referencing the next offset to
/// commit for its partition.
///
/// The offset is the *next* position to consume, i.e. the record's offset
/// plus one, which is what Kafka expects a consumer group to persist.
#[derive(Debug, Clone)]
pub struct CommittableOffset {
    tp: TopicPartition,
    next_offset: i64,
    metadata: Option<String>,
    handle: CommitHandle,
}

impl CommittableOffset {
    pub(crate) fn new(tp: TopicPartition, next_offset: i64, handle: CommitHandle) -> Self {
        Self {
            tp,
            next_offset,
            metadata: None,
            handle,
        }
    }

    /// Attach commit metadata persisted alongside the offset.
    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = Some(metadata.into());
        self
    }

    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    /// The offset that will be committed (last consumed offset + 1).
    pub fn next_offset(&self) -> i64 {
        self.next_offset
    }

    pub fn metadata(&self) -> Option<&str> {
        self.metadata.as_deref()
    }

    /// Commit this offset, suspending until the broker acknowledges.
    pub async fn commit(&self) -> Result<(), ConsumerError> {
        self.handle
            .commit(self.to_offset_map(), CommitMode::Sync)
            .await
    }

    /// Commit this offset through the client's asynchronous commit path.
    /// Completion still means broker acknowledgement.
    pub async fn commit_async(&self) -> Result<(), ConsumerError> {
        self.handle
            .commit(self.to_offset_map(), CommitMode::Async)
            .await
    }

    fn to_offset_map(&self) -> OffsetMap {
        let mut offsets = OffsetMap::new();
        let oam = match &self.metadata {
            Some(m) => OffsetAndMetadata::with_metadata(self.next_offset, m.clone()),
            None => OffsetAndMetadata::new(self.next_offset),
        };
        offsets.insert(self.tp.clone(), oam);
        offsets
    }
}

/// Fold a batch of committable offsets into one offset map, keeping the
/// highest offset per partition.
pub fn offsets_batch<I>(offsets: I) -> OffsetMap
where
    I: IntoIterator<Item = CommittableOffset>,
{
    let mut map = OffsetMap::new();
    for committable in offsets {
        let entry = map
            .entry(committable.tp.clone())
            .or_insert_with(|| OffsetAndMetadata::new(committable.next_offset));
        if committable.next_offset >= entry.offset {
            entry.offset = committable.next_offset;
            entry.metadata = committable.metadata.clone();
        }
    }
    map
}
