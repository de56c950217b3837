//! Public stream surfaces: evolving assignment maps, per-partition streams,
//! and their merged record stream.

use crate::rillstream::kafka::client::TopicPartition;
use crate::rillstream::kafka::kafka_error::ConsumerError;
use crate::rillstream::kafka::message::CommittableMessage;
use crate::rillstream::kafka::partition_stream::{PartitionStream, PartitionStreamFactory};
use crate::rillstream::kafka::requests::{
    PartitionStreamId, Request, StreamEvent, StreamId, StreamListener,
};
use crate::rillstream::kafka::serialization::Serde;
use futures::stream::{self, Stream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, oneshot};

/// Successive maps of newly assigned partitions to their record streams.
///
/// The first emission is the current assignment at subscription time;
/// every later emission carries only the partitions gained in one rebalance.
/// Streams for revoked partitions terminate on their own through the fetch
/// protocol, so revocations produce no emission here. The stream ends when
/// consuming stops or the consumer terminates.
pub(crate) fn partitions_map_stream<K, V, KS, VS>(
    factory: PartitionStreamFactory<K, V, KS, VS>,
    stream_id: StreamId,
) -> impl Stream<Item = BTreeMap<TopicPartition, PartitionStream<K, V, KS, VS>>> + Send
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    enum State<K, V, KS, VS> {
        Init(PartitionStreamFactory<K, V, KS, VS>),
        Running {
            factory: PartitionStreamFactory<K, V, KS, VS>,
            events: mpsc::UnboundedReceiver<StreamEvent>,
        },
    }

    stream::unfold(State::Init(factory), move |state| async move {
        match state {
            State::Init(factory) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (snapshot_tx, snapshot_rx) = oneshot::channel();
                let registered = factory.requests.send(Request::Assignment {
                    stream_id,
                    listener: Some(StreamListener {
                        stream_id,
                        events: events_tx,
                    }),
                    sink: snapshot_tx,
                });
                if registered.is_err() {
                    return None;
                }
                let reply = match snapshot_rx.await {
                    Ok(reply) => reply,
                    Err(_) => return None,
                };
                let map = build_map(&factory, stream_id, reply.assigned);
                Some((
                    map,
                    State::Running {
                        factory,
                        events: events_rx,
                    },
                ))
            }
            State::Running {
                factory,
                mut events,
            } => loop {
                match events.recv().await {
                    Some(StreamEvent::Assigned(assigned)) => {
                        let map = build_map(&factory, stream_id, assigned);
                        return Some((map, State::Running { factory, events }));
                    }
                    Some(StreamEvent::Revoked(_)) => continue,
                    Some(StreamEvent::Stopped) | None => return None,
                }
            },
        }
    })
}

fn build_map<K, V, KS, VS>(
    factory: &PartitionStreamFactory<K, V, KS, VS>,
    stream_id: StreamId,
    assigned: Vec<(TopicPartition, PartitionStreamId)>,
) -> BTreeMap<TopicPartition, PartitionStream<K, V, KS, VS>>
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    assigned
        .into_iter()
        .map(|(tp, psid)| {
            let stream = factory.create(tp.clone(), stream_id, psid);
            (tp, stream)
        })
        .collect()
}

/// Flattens the assignment maps into a stream of partition streams, in
/// partition iteration order.
pub(crate) fn partitioned_stream<K, V, KS, VS>(
    factory: PartitionStreamFactory<K, V, KS, VS>,
    stream_id: StreamId,
) -> impl Stream<Item = PartitionStream<K, V, KS, VS>> + Send
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    partitions_map_stream(factory, stream_id).flat_map(|map| stream::iter(map.into_values()))
}

/// Joins all partition streams concurrently. Cross-partition ordering is
/// lost; per-partition offset order is preserved.
pub(crate) fn merged_stream<K, V, KS, VS>(
    factory: PartitionStreamFactory<K, V, KS, VS>,
    stream_id: StreamId,
) -> impl Stream<Item = Result<CommittableMessage<K, V>, ConsumerError>> + Send
where
    KS: Serde<K> + 'static,
    VS: Serde<V> + 'static,
    K: Send + 'static,
    V: Send + 'static,
{
    partitioned_stream(factory, stream_id).flatten_unordered(None)
}

/// Distinct successive assignment snapshots.
///
/// The initial snapshot is always emitted, including the empty set; after
/// that only actual changes are emitted. Ends when consuming stops or the
/// consumer terminates.
pub(crate) fn assignment_stream(
    requests: mpsc::UnboundedSender<Request>,
    stream_id: StreamId,
) -> impl Stream<Item = BTreeSet<TopicPartition>> + Send {
    enum State {
        Init(mpsc::UnboundedSender<Request>),
        Running {
            events: mpsc::UnboundedReceiver<StreamEvent>,
            current: BTreeSet<TopicPartition>,
        },
    }

    stream::unfold(State::Init(requests), move |state| async move {
        match state {
            State::Init(requests) => {
                let (events_tx, events_rx) = mpsc::unbounded_channel();
                let (snapshot_tx, snapshot_rx) = oneshot::channel();
                let registered = requests.send(Request::Assignment {
                    stream_id,
                    listener: Some(StreamListener {
                        stream_id,
                        events: events_tx,
                    }),
                    sink: snapshot_tx,
                });
                if registered.is_err() {
                    return None;
                }
                let reply = match snapshot_rx.await {
                    Ok(reply) => reply,
                    Err(_) => return None,
                };
                let current: BTreeSet<TopicPartition> =
                    reply.assigned.into_iter().map(|(tp, _)| tp).collect();
                Some((
                    current.clone(),
                    State::Running {
                        events: events_rx,
                        current,
                    },
                ))
            }
            State::Running {
                mut events,
                mut current,
            } => loop {
                match events.recv().await {
                    Some(StreamEvent::Assigned(assigned)) => {
                        let before = current.len();
                        current.extend(assigned.into_iter().map(|(tp, _)| tp));
                        if current.len() != before {
                            return Some((
                                current.clone(),
                                State::Running { events, current },
                            ));
                        }
                    }
                    Some(StreamEvent::Revoked(revoked)) => {
                        let before = current.len();
                        current.retain(|tp| !revoked.contains(tp));
                        if current.len() != before {
                            return Some((
                                current.clone(),
                                State::Running { events, current },
                            ));
                        }
                    }
                    Some(StreamEvent::Stopped) | None => return None,
                }
            },
        }
    })
}
