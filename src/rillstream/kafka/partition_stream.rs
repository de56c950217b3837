//! Per-partition record streams and their demand loops.
//!
//! Each assigned partition gets one `PartitionStream` incarnation. A demand
//! loop task couples downstream pull with the actor's poll cycles: it keeps
//! exactly one fetch outstanding and parks on the bounded prefetch queue
//! when the downstream is slow, which in turn makes the actor pause the
//! partition at the client.

use crate::rillstream::kafka::client::{RawRecord, TopicPartition};
use crate::rillstream::kafka::commit::{CommitHandle, CommittableOffset};
use crate::rillstream::kafka::kafka_error::ConsumerError;
use crate::rillstream::kafka::lifecycle::ShutdownToken;
use crate::rillstream::kafka::message::{CommittableMessage, Message};
use crate::rillstream::kafka::requests::{FetchReason, PartitionStreamId, Request, StreamId};
use crate::rillstream::kafka::serialization::Serde;
use futures::Stream;
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// Shared ingredients for building partition streams of one consumer.
pub(crate) struct PartitionStreamFactory<K, V, KS, VS> {
    pub requests: mpsc::UnboundedSender<Request>,
    pub shutdown: ShutdownToken,
    pub committer: CommitHandle,
    pub key_serde: Arc<KS>,
    pub value_serde: Arc<VS>,
    pub max_prefetch_batches: usize,
    pub _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KS, VS> Clone for PartitionStreamFactory<K, V, KS, VS> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            shutdown: self.shutdown.clone(),
            committer: self.committer.clone(),
            key_serde: Arc::clone(&self.key_serde),
            value_serde: Arc::clone(&self.value_serde),
            max_prefetch_batches: self.max_prefetch_batches,
            _phantom: PhantomData,
        }
    }
}

impl<K, V, KS, VS> PartitionStreamFactory<K, V, KS, VS>
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    /// Create one partition-stream incarnation and spawn its demand loop.
    pub fn create(
        &self,
        tp: TopicPartition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
    ) -> PartitionStream<K, V, KS, VS> {
        let (chunks_tx, chunks_rx) = mpsc::channel(self.max_prefetch_batches);
        spawn_demand_loop(
            tp.clone(),
            stream_id,
            partition_stream_id,
            self.requests.clone(),
            chunks_tx,
            self.shutdown.clone(),
        );
        PartitionStream {
            tp,
            chunks: chunks_rx,
            current: VecDeque::new(),
            committer: self.committer.clone(),
            key_serde: Arc::clone(&self.key_serde),
            value_serde: Arc::clone(&self.value_serde),
            _phantom: PhantomData,
        }
    }
}

/// Demand loop: reserve a prefetch-queue slot, issue one fetch, wait for
/// its completion or shutdown, hand the chunk into the reserved slot,
/// repeat. Ends on revocation, stop, shutdown, or downstream drop;
/// dropping the queue sender is the stream's end-of-data marker.
///
/// Reserving before fetching bounds the unconsumed chunks at the queue
/// capacity and keeps a fetch outstanding only while a slot is free. With
/// capacity 1 the queue degenerates to a single-slot handoff: no fetch is
/// in flight while a delivered chunk has not been taken, so records
/// arriving in the meantime make the actor pause the partition.
fn spawn_demand_loop(
    tp: TopicPartition,
    stream_id: StreamId,
    partition_stream_id: PartitionStreamId,
    requests: mpsc::UnboundedSender<Request>,
    chunks_tx: mpsc::Sender<Vec<RawRecord>>,
    mut shutdown: ShutdownToken,
) {
    tokio::spawn(async move {
        loop {
            let slot = tokio::select! {
                _ = shutdown.triggered() => break,
                reserved = chunks_tx.reserve() => match reserved {
                    Ok(slot) => slot,
                    // downstream finalized
                    Err(_) => break,
                }
            };

            let (sink, done) = oneshot::channel();
            let sent = requests.send(Request::Fetch {
                tp: tp.clone(),
                stream_id,
                partition_stream_id,
                sink,
            });
            if sent.is_err() {
                break;
            }

            let completion = tokio::select! {
                _ = shutdown.triggered() => break,
                completed = done => match completed {
                    Ok(completion) => completion,
                    Err(_) => break,
                }
            };

            if !completion.records.is_empty() {
                slot.send(completion.records);
            }

            if completion.reason != FetchReason::FetchedRecords {
                log::debug!(
                    target: "partition_stream",
                    "{} stream {:?} ending: {:?}",
                    tp,
                    partition_stream_id,
                    completion.reason
                );
                break;
            }
        }
    });
}

/// Demand-driven stream of committable records for one partition
/// incarnation.
///
/// Records are emitted in strictly increasing offset order. Deserialization
/// happens at emission; a failing record yields an inline error item and
/// the stream continues.
pub struct PartitionStream<K, V, KS, VS> {
    tp: TopicPartition,
    chunks: mpsc::Receiver<Vec<RawRecord>>,
    current: VecDeque<RawRecord>,
    committer: CommitHandle,
    key_serde: Arc<KS>,
    value_serde: Arc<VS>,
    _phantom: PhantomData<fn() -> (K, V)>,
}

impl<K, V, KS, VS> PartitionStream<K, V, KS, VS>
where
    KS: Serde<K>,
    VS: Serde<V>,
{
    /// The partition this stream delivers records for
    pub fn topic_partition(&self) -> &TopicPartition {
        &self.tp
    }

    fn decode(&self, raw: RawRecord) -> Result<CommittableMessage<K, V>, ConsumerError> {
        let key = match raw.key {
            Some(bytes) => Some(self.key_serde.deserialize(&bytes)?),
            None => None,
        };
        let payload = raw.value.ok_or(ConsumerError::NoMessage)?;
        let value = self.value_serde.deserialize(&payload)?;

        let message = Message::new(
            key,
            value,
            raw.headers,
            raw.tp.partition,
            raw.offset,
            raw.timestamp,
        );
        let committable =
            CommittableOffset::new(raw.tp, raw.offset + 1, self.committer.clone());
        Ok(CommittableMessage::new(message, committable))
    }
}

impl<K, V, KS, VS> Stream for PartitionStream<K, V, KS, VS>
where
    KS: Serde<K>,
    VS: Serde<V>,
{
    type Item = Result<CommittableMessage<K, V>, ConsumerError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(raw) = this.current.pop_front() {
                return Poll::Ready(Some(this.decode(raw)));
            }
            match this.chunks.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    this.current = chunk.into();
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
