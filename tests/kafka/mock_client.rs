//! Deterministic in-memory Kafka client for driving the consumer engine
//! without a broker.
//!
//! A `MockCluster` holds partition logs and per-group committed offsets and
//! can be shared by several clients, so group-resume scenarios work across
//! consumer instances. Each client exposes a `MockController` the test uses
//! to inject rebalances and failures and to observe pause/resume traffic.

use rillstream::rillstream::kafka::client::{CommitCallback, PollOutcome};
use rillstream::{
    CommitError, ConsumerClient, Headers, OffsetAndMetadata, OffsetMap, RawRecord, RebalanceEvent,
    TopicPartition,
};
use rdkafka::error::KafkaError;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const RECORDS_PER_POLL: usize = 100;

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
}

#[derive(Default)]
struct ClusterState {
    logs: BTreeMap<TopicPartition, Vec<StoredRecord>>,
    committed: BTreeMap<String, BTreeMap<TopicPartition, OffsetAndMetadata>>,
}

/// Shared in-memory cluster: partition logs plus the group offset ledger.
#[derive(Clone, Default)]
pub struct MockCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state.lock().unwrap();
        for partition in 0..partitions {
            state
                .logs
                .entry(TopicPartition::new(topic, partition))
                .or_default();
        }
    }

    /// Append a record, returning its offset.
    pub fn produce(&self, topic: &str, partition: i32, key: Option<&[u8]>, value: &[u8]) -> i64 {
        let mut state = self.state.lock().unwrap();
        let log = state
            .logs
            .entry(TopicPartition::new(topic, partition))
            .or_default();
        log.push(StoredRecord {
            key: key.map(|k| k.to_vec()),
            value: Some(value.to_vec()),
        });
        (log.len() - 1) as i64
    }

    /// Committed offsets for a consumer group.
    pub fn committed(&self, group: &str) -> BTreeMap<TopicPartition, OffsetAndMetadata> {
        self.state
            .lock()
            .unwrap()
            .committed
            .get(group)
            .cloned()
            .unwrap_or_default()
    }

    pub fn partitions_of(&self, topic: &str) -> Vec<i32> {
        self.state
            .lock()
            .unwrap()
            .logs
            .keys()
            .filter(|tp| tp.topic == topic)
            .map(|tp| tp.partition)
            .collect()
    }

    /// Build a client for a consumer group on this cluster, returning the
    /// client and its test-side controller.
    pub fn client(&self, group: &str) -> (MockConsumerClient, MockController) {
        let shared = Arc::new(Mutex::new(ClientState::default()));
        let client = MockConsumerClient {
            cluster: self.clone(),
            group: group.to_string(),
            shared: Arc::clone(&shared),
        };
        (client, MockController { shared })
    }
}

#[derive(Default)]
struct ClientState {
    subscribed: Vec<String>,
    assignment: BTreeSet<TopicPartition>,
    positions: HashMap<TopicPartition, i64>,
    paused: BTreeSet<TopicPartition>,
    pending_rebalances: VecDeque<RebalanceEvent>,
    commit_failures: VecDeque<CommitError>,
    hang_commits: bool,
    poll_error: Option<KafkaError>,
    commit_attempts: usize,
    pause_log: Vec<BTreeSet<TopicPartition>>,
    resume_log: Vec<BTreeSet<TopicPartition>>,
    closed: bool,
}

/// Test-side handle onto one client's scripted behavior and observations.
#[derive(Clone)]
pub struct MockController {
    shared: Arc<Mutex<ClientState>>,
}

impl MockController {
    /// Inject a rebalance transition, surfaced by the client's next poll.
    pub fn inject_rebalance(&self, event: RebalanceEvent) {
        self.shared
            .lock()
            .unwrap()
            .pending_rebalances
            .push_back(event);
    }

    pub fn assign(&self, tps: impl IntoIterator<Item = TopicPartition>) {
        self.inject_rebalance(RebalanceEvent::Assigned(tps.into_iter().collect()));
    }

    pub fn revoke(&self, tps: impl IntoIterator<Item = TopicPartition>) {
        self.inject_rebalance(RebalanceEvent::Revoked(tps.into_iter().collect()));
    }

    /// Script the next commits to fail with the given error.
    pub fn fail_commits(&self, errors: impl IntoIterator<Item = CommitError>) {
        self.shared
            .lock()
            .unwrap()
            .commit_failures
            .extend(errors);
    }

    /// Swallow commit callbacks entirely (commits never acknowledge).
    pub fn hang_commits(&self, hang: bool) {
        self.shared.lock().unwrap().hang_commits = hang;
    }

    /// Make the next poll fail fatally.
    pub fn fail_next_poll(&self, error: KafkaError) {
        self.shared.lock().unwrap().poll_error = Some(error);
    }

    pub fn commit_attempts(&self) -> usize {
        self.shared.lock().unwrap().commit_attempts
    }

    pub fn pause_log(&self) -> Vec<BTreeSet<TopicPartition>> {
        self.shared.lock().unwrap().pause_log.clone()
    }

    pub fn resume_log(&self) -> Vec<BTreeSet<TopicPartition>> {
        self.shared.lock().unwrap().resume_log.clone()
    }

    pub fn is_paused(&self, tp: &TopicPartition) -> bool {
        self.shared.lock().unwrap().paused.contains(tp)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().unwrap().closed
    }

    pub fn subscribed_topics(&self) -> Vec<String> {
        self.shared.lock().unwrap().subscribed.clone()
    }
}

/// In-memory `ConsumerClient`: poll serves records from the cluster logs at
/// each assigned partition's position, honoring pauses; commits write the
/// group ledger and acknowledge synchronously.
pub struct MockConsumerClient {
    cluster: MockCluster,
    group: String,
    shared: Arc<Mutex<ClientState>>,
}

impl MockConsumerClient {
    fn start_position(&self, tp: &TopicPartition) -> i64 {
        self.cluster
            .committed(&self.group)
            .get(tp)
            .map(|oam| oam.offset)
            .unwrap_or(0)
    }

    fn apply_rebalance_locally(&self, state: &mut ClientState, event: &RebalanceEvent) {
        match event {
            RebalanceEvent::Assigned(tps) => {
                for tp in tps {
                    state.assignment.insert(tp.clone());
                    let position = self.start_position(tp);
                    state.positions.entry(tp.clone()).or_insert(position);
                }
            }
            RebalanceEvent::Revoked(tps) => {
                for tp in tps {
                    state.assignment.remove(tp);
                    state.positions.remove(tp);
                    state.paused.remove(tp);
                }
            }
        }
    }
}

impl ConsumerClient for MockConsumerClient {
    fn subscribe(&mut self, topics: &[String]) -> Result<(), KafkaError> {
        let mut assigned = BTreeSet::new();
        for topic in topics {
            for partition in self.cluster.partitions_of(topic) {
                assigned.insert(TopicPartition::new(topic.clone(), partition));
            }
        }
        let mut state = self.shared.lock().unwrap();
        state.subscribed = topics.to_vec();
        // group join: all partitions land on this member at the next poll
        state
            .pending_rebalances
            .push_back(RebalanceEvent::Assigned(assigned));
        Ok(())
    }

    fn subscribe_pattern(&mut self, pattern: &str) -> Result<(), KafkaError> {
        let bare = pattern.trim_start_matches('^');
        let topics: BTreeSet<String> = {
            let state = self.cluster.state.lock().unwrap();
            state
                .logs
                .keys()
                .filter(|tp| tp.topic.starts_with(bare))
                .map(|tp| tp.topic.clone())
                .collect()
        };
        let topics: Vec<String> = topics.into_iter().collect();
        self.subscribe(&topics)
    }

    fn assign(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        for tp in tps {
            state.assignment.insert(tp.clone());
            let position = self.start_position(tp);
            state.positions.entry(tp.clone()).or_insert(position);
        }
        Ok(())
    }

    fn unsubscribe(&mut self) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        state.subscribed.clear();
        state.assignment.clear();
        state.positions.clear();
        state.paused.clear();
        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> Result<PollOutcome, KafkaError> {
        let mut state = self.shared.lock().unwrap();
        if let Some(error) = state.poll_error.take() {
            return Err(error);
        }

        let mut outcome = PollOutcome::default();
        while let Some(event) = state.pending_rebalances.pop_front() {
            self.apply_rebalance_locally(&mut *state, &event);
            outcome.rebalances.push(event);
        }

        let cluster = self.cluster.state.lock().unwrap();
        let assigned: Vec<TopicPartition> = state.assignment.iter().cloned().collect();
        for tp in assigned {
            if state.paused.contains(&tp) {
                continue;
            }
            let position = state.positions.get(&tp).copied().unwrap_or(0);
            let log = match cluster.logs.get(&tp) {
                Some(log) => log,
                None => continue,
            };
            let available = log.len() as i64 - position;
            if available <= 0 {
                continue;
            }
            let take = (available as usize).min(RECORDS_PER_POLL);
            for i in 0..take {
                let offset = position + i as i64;
                let stored = &log[offset as usize];
                outcome.records.push(RawRecord {
                    tp: tp.clone(),
                    offset,
                    key: stored.key.clone(),
                    value: stored.value.clone(),
                    timestamp: Some(offset),
                    headers: Headers::new(),
                });
            }
            state.positions.insert(tp, position + take as i64);
        }
        Ok(outcome)
    }

    fn commit(&mut self, offsets: &OffsetMap, done: CommitCallback) {
        let mut state = self.shared.lock().unwrap();
        state.commit_attempts += 1;
        if state.hang_commits {
            // swallow the callback: the broker never answers
            return;
        }
        if let Some(error) = state.commit_failures.pop_front() {
            done(Err(error));
            return;
        }
        drop(state);
        let mut cluster = self.cluster.state.lock().unwrap();
        let ledger = cluster.committed.entry(self.group.clone()).or_default();
        for (tp, oam) in offsets {
            ledger.insert(tp.clone(), oam.clone());
        }
        done(Ok(()));
    }

    fn pause(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        let set: BTreeSet<TopicPartition> = tps.iter().cloned().collect();
        state.paused.extend(set.iter().cloned());
        state.pause_log.push(set);
        Ok(())
    }

    fn resume(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        let set: BTreeSet<TopicPartition> = tps.iter().cloned().collect();
        for tp in &set {
            state.paused.remove(tp);
        }
        state.resume_log.push(set);
        Ok(())
    }

    fn seek(&mut self, tp: &TopicPartition, offset: i64) -> Result<(), KafkaError> {
        self.shared
            .lock()
            .unwrap()
            .positions
            .insert(tp.clone(), offset);
        Ok(())
    }

    fn seek_to_beginning(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        for tp in tps {
            state.positions.insert(tp.clone(), 0);
        }
        Ok(())
    }

    fn seek_to_end(&mut self, tps: &[TopicPartition]) -> Result<(), KafkaError> {
        let mut state = self.shared.lock().unwrap();
        let cluster = self.cluster.state.lock().unwrap();
        for tp in tps {
            let end = cluster.logs.get(tp).map(|log| log.len() as i64).unwrap_or(0);
            state.positions.insert(tp.clone(), end);
        }
        Ok(())
    }

    fn position(&mut self, tp: &TopicPartition) -> Result<i64, KafkaError> {
        self.shared
            .lock()
            .unwrap()
            .positions
            .get(tp)
            .copied()
            .ok_or(KafkaError::OffsetFetch(
                rdkafka::types::RDKafkaErrorCode::NoOffset,
            ))
    }

    fn partitions_for(&mut self, topic: &str) -> Result<Vec<i32>, KafkaError> {
        Ok(self.cluster.partitions_of(topic))
    }

    fn beginning_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError> {
        Ok(tps.iter().map(|tp| (tp.clone(), 0)).collect())
    }

    fn end_offsets(
        &mut self,
        tps: &[TopicPartition],
    ) -> Result<BTreeMap<TopicPartition, i64>, KafkaError> {
        let cluster = self.cluster.state.lock().unwrap();
        Ok(tps
            .iter()
            .map(|tp| {
                let end = cluster.logs.get(tp).map(|log| log.len() as i64).unwrap_or(0);
                (tp.clone(), end)
            })
            .collect())
    }

    fn metrics(&mut self) -> Option<String> {
        None
    }

    fn close(&mut self) {
        self.shared.lock().unwrap().closed = true;
    }
}
