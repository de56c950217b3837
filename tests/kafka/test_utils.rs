use super::mock_client::{MockCluster, MockConsumerClient, MockController};
use rillstream::{
    ConsumerBuilder, ConsumerClient, ConsumerConfig, KafkaConsumer, StringSerializer,
    TopicPartition,
};
use std::collections::BTreeSet;
use std::time::Duration;

pub type StringConsumer =
    KafkaConsumer<String, String, StringSerializer, StringSerializer, MockConsumerClient>;

pub fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Configuration with intervals tight enough for scenario tests.
pub fn fast_config(group: &str) -> ConsumerConfig {
    ConsumerConfig::new("mock:9092", group)
        .poll_interval(Duration::from_millis(2))
        .poll_timeout(Duration::from_millis(1))
        .commit_timeout(Duration::from_millis(200))
}

pub fn string_consumer(cluster: &MockCluster, group: &str) -> (StringConsumer, MockController) {
    string_consumer_with(cluster, group, fast_config(group))
}

pub fn string_consumer_with(
    cluster: &MockCluster,
    group: &str,
    config: ConsumerConfig,
) -> (StringConsumer, MockController) {
    let (client, controller) = cluster.client(group);
    let consumer = ConsumerBuilder::<String, String, _, _>::new(
        "mock:9092",
        group,
        StringSerializer,
        StringSerializer,
    )
    .config(config)
    .build_with_client(client);
    (consumer, controller)
}

/// Poll the consumer's assignment until it holds at least `min` partitions.
pub async fn wait_for_assignment<C: ConsumerClient>(
    consumer: &KafkaConsumer<String, String, StringSerializer, StringSerializer, C>,
    min: usize,
) -> BTreeSet<TopicPartition> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let assignment = consumer.assignment().await.expect("assignment query");
        if assignment.len() >= min {
            return assignment;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "assignment of {} partition(s) not reached in time",
            min
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
