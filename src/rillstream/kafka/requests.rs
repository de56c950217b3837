//! Request messages carried from user-facing operations to the consumer
//! actor, plus their completion payloads.

use crate::rillstream::kafka::client::{OffsetMap, RawRecord, TopicPartition};
use crate::rillstream::kafka::kafka_error::ConsumerError;
use std::collections::BTreeSet;
use tokio::sync::{mpsc, oneshot};

/// Identifies one top-level stream instantiation. Monotonically increasing;
/// stale fetch replies after a resubscription carry an old id and are
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

/// Identifies one partition-stream incarnation. A revocation followed by a
/// re-assignment of the same partition produces a fresh id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionStreamId(pub u64);

/// Why a fetch completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    /// Records were available for the requested partition
    FetchedRecords,
    /// The partition was revoked (or the fetch was stale); the stream must end
    TopicPartitionRevoked,
    /// The consumer is stopping; the stream must end after draining
    StreamFinished,
}

/// Completion of one fetch request. `records`, when non-empty, belong to the
/// requested partition and are offset-ordered.
#[derive(Debug)]
pub struct FetchCompletion {
    pub records: Vec<RawRecord>,
    pub reason: FetchReason,
}

impl FetchCompletion {
    pub fn records(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            reason: FetchReason::FetchedRecords,
        }
    }

    pub fn revoked(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            reason: FetchReason::TopicPartitionRevoked,
        }
    }

    pub fn finished(records: Vec<RawRecord>) -> Self {
        Self {
            records,
            reason: FetchReason::StreamFinished,
        }
    }
}

pub type FetchSink = oneshot::Sender<FetchCompletion>;
pub type AckSink = oneshot::Sender<Result<(), ConsumerError>>;

/// Whether the caller asked for a synchronous or asynchronous commit. Both
/// complete only after broker acknowledgement; the distinction is kept for
/// API parity and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Sync,
    Async,
}

#[derive(Debug)]
pub struct CommitRequest {
    pub offsets: OffsetMap,
    pub mode: CommitMode,
    pub attempt: u32,
    pub sink: AckSink,
}

/// Rebalance notification pushed to a registered top-level stream.
#[derive(Debug)]
pub enum StreamEvent {
    /// Newly assigned partitions with their fresh incarnation ids
    Assigned(Vec<(TopicPartition, PartitionStreamId)>),
    /// Partitions taken away by the group coordinator
    Revoked(BTreeSet<TopicPartition>),
    /// The consumer stopped consuming; no further events follow
    Stopped,
}

/// Listener registered per top-level stream; the actor pushes rebalance
/// events here from inside its poll sequence.
#[derive(Debug)]
pub struct StreamListener {
    pub stream_id: StreamId,
    pub events: mpsc::UnboundedSender<StreamEvent>,
}

/// Reply to an `Assignment` request: the current assignment snapshot with
/// the incarnation ids recorded for the requesting stream.
#[derive(Debug)]
pub struct AssignmentReply {
    pub assigned: Vec<(TopicPartition, PartitionStreamId)>,
}

/// Tagged requests consumed by the actor, one at a time.
#[derive(Debug)]
pub enum Request {
    SubscribeTopics {
        topics: Vec<String>,
        sink: AckSink,
    },
    SubscribePattern {
        pattern: String,
        sink: AckSink,
    },
    Assign {
        tps: Vec<TopicPartition>,
        sink: AckSink,
    },
    Unsubscribe {
        sink: AckSink,
    },
    Fetch {
        tp: TopicPartition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
        sink: FetchSink,
    },
    Assignment {
        stream_id: StreamId,
        listener: Option<StreamListener>,
        sink: oneshot::Sender<AssignmentReply>,
    },
    Commit(CommitRequest),
    StopConsuming,
    Poll,
}
