//! The consumer actor: sole owner of the Kafka client's request traffic.
//!
//! The actor is a sequential consumer of two queues. User-originated
//! requests take priority via a non-blocking probe; when idle, the actor
//! parks on the capacity-1 poll queue fed by the scheduler, so a poll cycle
//! always happens eventually. Every client call the actor makes goes
//! through the shared `ConsumerHandle`.

use crate::rillstream::kafka::client::{
    ConsumerClient, RawRecord, RebalanceEvent, TopicPartition,
};
use crate::rillstream::kafka::consumer_config::{CommitRecovery, ConsumerConfig};
use crate::rillstream::kafka::handle::ConsumerHandle;
use crate::rillstream::kafka::kafka_error::{CommitError, ConsumerError};
use crate::rillstream::kafka::lifecycle::ShutdownToken;
use crate::rillstream::kafka::requests::{
    AssignmentReply, CommitRequest, FetchCompletion, FetchSink, PartitionStreamId, Request,
    StreamEvent, StreamId, StreamListener,
};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

struct PendingFetch {
    partition_stream_id: PartitionStreamId,
    sink: FetchSink,
}

/// Single-writer state owned by the actor. Mutated only from inside the
/// actor loop.
#[derive(Default)]
struct ActorState {
    assignment: BTreeSet<TopicPartition>,
    fetches: HashMap<TopicPartition, HashMap<StreamId, PendingFetch>>,
    buffered: HashMap<TopicPartition, Vec<RawRecord>>,
    paused: BTreeSet<TopicPartition>,
    listeners: Vec<StreamListener>,
    partition_gen: HashMap<(StreamId, TopicPartition), PartitionStreamId>,
    next_partition_stream_id: u64,
    stop_consuming: bool,
}

impl ActorState {
    fn next_psid(&mut self) -> PartitionStreamId {
        let id = PartitionStreamId(self.next_partition_stream_id);
        self.next_partition_stream_id += 1;
        id
    }
}

pub(crate) struct ConsumerActor<C: ConsumerClient> {
    handle: ConsumerHandle<C>,
    requests_rx: mpsc::UnboundedReceiver<Request>,
    requests_tx: mpsc::UnboundedSender<Request>,
    polls_rx: mpsc::Receiver<Request>,
    poll_timeout: Duration,
    commit_timeout: Duration,
    commit_recovery: CommitRecovery,
    state: ActorState,
}

impl<C: ConsumerClient> ConsumerActor<C> {
    pub fn new(
        handle: ConsumerHandle<C>,
        requests_rx: mpsc::UnboundedReceiver<Request>,
        requests_tx: mpsc::UnboundedSender<Request>,
        polls_rx: mpsc::Receiver<Request>,
        config: &ConsumerConfig,
    ) -> Self {
        Self {
            handle,
            requests_rx,
            requests_tx,
            polls_rx,
            poll_timeout: config.poll_timeout,
            commit_timeout: config.commit_timeout,
            commit_recovery: config.commit_recovery,
            state: ActorState::default(),
        }
    }

    /// Run the actor until shutdown or a fatal poll error, then release the
    /// client.
    pub async fn run(mut self, mut shutdown: ShutdownToken) -> Result<(), ConsumerError> {
        log::debug!(target: "consumer_actor", "started");
        let result = self.serve(&mut shutdown).await;
        self.finalize().await;
        result
    }

    async fn serve(&mut self, shutdown: &mut ShutdownToken) -> Result<(), ConsumerError> {
        loop {
            let request = match self.requests_rx.try_recv() {
                Ok(request) => request,
                Err(TryRecvError::Empty) => {
                    tokio::select! {
                        _ = shutdown.triggered() => return Ok(()),
                        polled = self.polls_rx.recv() => match polled {
                            Some(request) => request,
                            None => return Ok(()),
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => return Ok(()),
            };
            self.dispatch(request).await?;
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<(), ConsumerError> {
        match request {
            Request::Poll => self.poll().await,
            Request::Fetch {
                tp,
                stream_id,
                partition_stream_id,
                sink,
            } => self.handle_fetch(tp, stream_id, partition_stream_id, sink).await,
            Request::SubscribeTopics { topics, sink } => {
                let result = self
                    .handle
                    .blocking(move |c| c.subscribe(&topics))
                    .await
                    .and_then(|r| r.map_err(ConsumerError::from));
                let _ = sink.send(result);
                Ok(())
            }
            Request::SubscribePattern { pattern, sink } => {
                let result = self
                    .handle
                    .blocking(move |c| c.subscribe_pattern(&pattern))
                    .await
                    .and_then(|r| r.map_err(ConsumerError::from));
                let _ = sink.send(result);
                Ok(())
            }
            Request::Assign { tps, sink } => {
                let assigned = tps.clone();
                let result = self
                    .handle
                    .blocking(move |c| c.assign(&tps))
                    .await
                    .and_then(|r| r.map_err(ConsumerError::from));
                // Manual assignment bypasses the group protocol, so no
                // rebalance callback will ever report it; bookkeep here.
                if result.is_ok() {
                    self.apply_assigned(assigned.into_iter().collect());
                }
                let _ = sink.send(result);
                Ok(())
            }
            Request::Unsubscribe { sink } => {
                let result = self
                    .handle
                    .blocking(move |c| c.unsubscribe())
                    .await
                    .and_then(|r| r.map_err(ConsumerError::from));
                if result.is_ok() {
                    let revoked = self.state.assignment.clone();
                    self.apply_revoked(&revoked);
                }
                let _ = sink.send(result);
                Ok(())
            }
            Request::Assignment {
                stream_id,
                listener,
                sink,
            } => {
                self.register_assignment(stream_id, listener, sink);
                Ok(())
            }
            Request::Commit(commit) => self.drive_commit(commit).await,
            Request::StopConsuming => {
                self.stop_consuming();
                Ok(())
            }
        }
    }

    /// One poll cycle: drive the client, apply rebalance transitions first,
    /// then route records into per-partition buffers and satisfy waiting
    /// fetches.
    async fn poll(&mut self) -> Result<(), ConsumerError> {
        let timeout = self.poll_timeout;
        let outcome = self.handle.blocking(move |c| c.poll(timeout)).await??;

        for event in outcome.rebalances {
            match event {
                RebalanceEvent::Assigned(tps) => self.apply_assigned(tps),
                RebalanceEvent::Revoked(tps) => self.apply_revoked(&tps),
            }
        }

        for record in outcome.records {
            if !self.state.assignment.contains(&record.tp) {
                log::debug!(
                    target: "consumer_actor",
                    "dropping record for unassigned partition {} at offset {}",
                    record.tp,
                    record.offset
                );
                continue;
            }
            self.state
                .buffered
                .entry(record.tp.clone())
                .or_default()
                .push(record);
        }

        self.complete_ready_fetches();
        self.reconcile_pauses().await
    }

    async fn handle_fetch(
        &mut self,
        tp: TopicPartition,
        stream_id: StreamId,
        partition_stream_id: PartitionStreamId,
        sink: FetchSink,
    ) -> Result<(), ConsumerError> {
        if self.state.stop_consuming {
            let _ = sink.send(FetchCompletion::finished(Vec::new()));
            return Ok(());
        }
        let current = self.state.partition_gen.get(&(stream_id, tp.clone()));
        if current != Some(&partition_stream_id) || !self.state.assignment.contains(&tp) {
            let _ = sink.send(FetchCompletion::revoked(Vec::new()));
            return Ok(());
        }

        match self.state.buffered.remove(&tp) {
            Some(records) if !records.is_empty() => {
                let _ = sink.send(FetchCompletion::records(records));
                if self.state.paused.remove(&tp) {
                    let tps = vec![tp];
                    self.handle.blocking(move |c| c.resume(&tps)).await??;
                }
            }
            _ => {
                // at most one pending fetch per (partition, stream);
                // a duplicate overwrites the previous sink
                self.state
                    .fetches
                    .entry(tp)
                    .or_default()
                    .insert(
                        stream_id,
                        PendingFetch {
                            partition_stream_id,
                            sink,
                        },
                    );
            }
        }
        Ok(())
    }

    fn register_assignment(
        &mut self,
        stream_id: StreamId,
        listener: Option<StreamListener>,
        sink: oneshot::Sender<AssignmentReply>,
    ) {
        let registering = listener.is_some();
        if let Some(listener) = listener {
            if self.state.stop_consuming {
                let _ = listener.events.send(StreamEvent::Stopped);
            } else {
                self.state.listeners.push(listener);
            }
        }
        if registering && self.state.stop_consuming {
            // no partition streams come into existence once consuming stopped
            let _ = sink.send(AssignmentReply {
                assigned: Vec::new(),
            });
            return;
        }

        let has_listener = self
            .state
            .listeners
            .iter()
            .any(|l| l.stream_id == stream_id);
        let mut assigned = Vec::with_capacity(self.state.assignment.len());
        let assignment: Vec<TopicPartition> = self.state.assignment.iter().cloned().collect();
        for tp in assignment {
            let key = (stream_id, tp.clone());
            let id = match self.state.partition_gen.get(&key) {
                Some(id) => *id,
                None if has_listener => {
                    let id = self.state.next_psid();
                    self.state.partition_gen.insert(key, id);
                    id
                }
                None => PartitionStreamId(0),
            };
            assigned.push((tp, id));
        }
        let _ = sink.send(AssignmentReply { assigned });
    }

    fn apply_assigned(&mut self, tps: BTreeSet<TopicPartition>) {
        let new_tps: Vec<TopicPartition> = tps
            .into_iter()
            .filter(|tp| !self.state.assignment.contains(tp))
            .collect();
        if new_tps.is_empty() {
            return;
        }
        log::info!(
            target: "consumer_actor",
            "assigned {} partition(s): {}",
            new_tps.len(),
            join_tps(&new_tps)
        );
        self.state.assignment.extend(new_tps.iter().cloned());
        if self.state.stop_consuming {
            return;
        }

        self.state.listeners.retain(|l| !l.events.is_closed());
        let stream_ids: Vec<StreamId> = self.state.listeners.iter().map(|l| l.stream_id).collect();
        for stream_id in stream_ids {
            let mut assigned = Vec::with_capacity(new_tps.len());
            for tp in &new_tps {
                let id = self.state.next_psid();
                self.state.partition_gen.insert((stream_id, tp.clone()), id);
                assigned.push((tp.clone(), id));
            }
            if let Some(listener) = self
                .state
                .listeners
                .iter()
                .find(|l| l.stream_id == stream_id)
            {
                let _ = listener.events.send(StreamEvent::Assigned(assigned));
            }
        }
    }

    fn apply_revoked(&mut self, tps: &BTreeSet<TopicPartition>) {
        let revoked: Vec<TopicPartition> = tps
            .iter()
            .filter(|tp| self.state.assignment.contains(*tp))
            .cloned()
            .collect();
        if revoked.is_empty() {
            return;
        }
        log::info!(
            target: "consumer_actor",
            "revoked {} partition(s): {}",
            revoked.len(),
            join_tps(&revoked)
        );

        for tp in &revoked {
            let buffered = self.state.buffered.remove(tp).unwrap_or_default();
            if let Some(waiters) = self.state.fetches.remove(tp) {
                complete_all(waiters, buffered, FetchCompletion::revoked);
            }
            self.state.paused.remove(tp);
            self.state.assignment.remove(tp);
        }
        self.state
            .partition_gen
            .retain(|(_, tp), _| !revoked.contains(tp));

        let revoked_set: BTreeSet<TopicPartition> = revoked.into_iter().collect();
        self.state.listeners.retain(|l| !l.events.is_closed());
        for listener in &self.state.listeners {
            let _ = listener
                .events
                .send(StreamEvent::Revoked(revoked_set.clone()));
        }
    }

    fn complete_ready_fetches(&mut self) {
        let ready: Vec<TopicPartition> = self
            .state
            .fetches
            .keys()
            .filter(|tp| {
                self.state
                    .buffered
                    .get(*tp)
                    .map_or(false, |records| !records.is_empty())
            })
            .cloned()
            .collect();
        for tp in ready {
            let records = self.state.buffered.remove(&tp).unwrap_or_default();
            if let Some(waiters) = self.state.fetches.remove(&tp) {
                complete_all(waiters, records, FetchCompletion::records);
            }
        }
    }

    /// A partition with buffered records but no waiting fetch is paused at
    /// the client so the broker stops feeding it; the matching resume
    /// happens when the next fetch drains the buffer.
    async fn reconcile_pauses(&mut self) -> Result<(), ConsumerError> {
        let to_pause: Vec<TopicPartition> = self
            .state
            .buffered
            .iter()
            .filter(|(tp, records)| {
                !records.is_empty()
                    && !self.state.fetches.contains_key(*tp)
                    && !self.state.paused.contains(*tp)
                    && self.state.assignment.contains(*tp)
            })
            .map(|(tp, _)| tp.clone())
            .collect();
        if to_pause.is_empty() {
            return Ok(());
        }
        log::debug!(
            target: "consumer_actor",
            "pausing {} partition(s) with unconsumed buffers",
            to_pause.len()
        );
        let tps = to_pause.clone();
        self.handle.blocking(move |c| c.pause(&tps)).await??;
        self.state.paused.extend(to_pause);
        Ok(())
    }

    /// Initiate a commit through the client and hand completion plumbing to
    /// a detached waiter so the actor never blocks on the broker.
    async fn drive_commit(&mut self, commit: CommitRequest) -> Result<(), ConsumerError> {
        let CommitRequest {
            offsets,
            mode,
            attempt,
            sink,
        } = commit;
        log::debug!(
            target: "consumer_actor",
            "committing {} partition(s) ({:?}, attempt {})",
            offsets.len(),
            mode,
            attempt
        );

        let (done_tx, done_rx) = oneshot::channel();
        let client_offsets = offsets.clone();
        let started = self
            .handle
            .blocking(move |c| {
                c.commit(
                    &client_offsets,
                    Box::new(move |result| {
                        let _ = done_tx.send(result);
                    }),
                );
            })
            .await;
        if let Err(err) = started {
            let _ = sink.send(Err(err));
            return Ok(());
        }

        let requests_tx = self.requests_tx.clone();
        let recovery = self.commit_recovery;
        let commit_timeout = self.commit_timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(commit_timeout, done_rx).await {
                Ok(Ok(Ok(()))) => {
                    let _ = sink.send(Ok(()));
                }
                Ok(Ok(Err(commit_err))) => {
                    if commit_err.is_retriable() && recovery.should_retry(attempt) {
                        log::warn!(
                            target: "consumer_actor",
                            "retriable commit failure (attempt {}): {}",
                            attempt,
                            commit_err
                        );
                        tokio::time::sleep(recovery.backoff(attempt + 1)).await;
                        let retry = CommitRequest {
                            offsets,
                            mode,
                            attempt: attempt + 1,
                            sink,
                        };
                        if let Err(not_sent) = requests_tx.send(Request::Commit(retry)) {
                            if let Request::Commit(req) = not_sent.0 {
                                let _ = req.sink.send(Err(ConsumerError::Shutdown));
                            }
                        }
                    } else {
                        let _ = sink.send(Err(ConsumerError::Commit(commit_err)));
                    }
                }
                Ok(Err(_client_gone)) => {
                    let _ = sink.send(Err(ConsumerError::Shutdown));
                }
                Err(_elapsed) => {
                    let _ = sink.send(Err(ConsumerError::Commit(CommitError::TimedOut)));
                }
            }
        });
        Ok(())
    }

    /// Stop consuming. Monotonic: pending and future fetches finish, stream
    /// listeners see a terminator, but commits in flight still complete.
    fn stop_consuming(&mut self) {
        if self.state.stop_consuming {
            return;
        }
        log::info!(target: "consumer_actor", "stop consuming requested");
        self.state.stop_consuming = true;

        let pending: Vec<TopicPartition> = self.state.fetches.keys().cloned().collect();
        for tp in pending {
            let buffered = self.state.buffered.remove(&tp).unwrap_or_default();
            if let Some(waiters) = self.state.fetches.remove(&tp) {
                complete_all(waiters, buffered, FetchCompletion::finished);
            }
        }
        self.state.buffered.clear();
        for listener in self.state.listeners.drain(..) {
            let _ = listener.events.send(StreamEvent::Stopped);
        }
    }

    async fn finalize(&mut self) {
        for (_tp, waiters) in self.state.fetches.drain() {
            complete_all(waiters, Vec::new(), FetchCompletion::finished);
        }
        for listener in self.state.listeners.drain(..) {
            let _ = listener.events.send(StreamEvent::Stopped);
        }
        self.handle.close().await;
        log::debug!(target: "consumer_actor", "stopped");
    }
}

fn complete_all(
    waiters: HashMap<StreamId, PendingFetch>,
    records: Vec<RawRecord>,
    completion: fn(Vec<RawRecord>) -> FetchCompletion,
) {
    let mut waiters: Vec<PendingFetch> = waiters.into_values().collect();
    if let Some(last) = waiters.pop() {
        for other in waiters {
            let _ = other.sink.send(completion(records.clone()));
        }
        let _ = last.sink.send(completion(records));
    }
}

fn join_tps(tps: &[TopicPartition]) -> String {
    tps.iter()
        .map(|tp| tp.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
