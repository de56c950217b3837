use super::mock_client::MockCluster;
use super::test_utils::{init, string_consumer, wait_for_assignment};
use futures::StreamExt;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rillstream::{ConsumerError, OffsetAndMetadata, OffsetMap, TopicPartition};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread")]
async fn test_deserialization_failure_is_inline_and_consumer_survives() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    let tp = TopicPartition::new("t", 0);
    cluster.produce("t", 0, None, b"fine");
    cluster.produce("t", 0, None, &[0xff, 0xfe, 0xfd]);
    cluster.produce("t", 0, None, b"also fine");

    let (consumer, _controller) = string_consumer(&cluster, "deser-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");

    let mut stream = Box::pin(consumer.stream());
    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record")
        .expect("open");
    assert_eq!(first.expect("valid").value(), "fine");

    let second = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record")
        .expect("open");
    assert!(matches!(second, Err(ConsumerError::Serialization(_))));

    let third = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record")
        .expect("open");
    assert_eq!(third.expect("valid").value(), "also fine");

    // the consumer is still alive and can commit
    let mut offsets = OffsetMap::new();
    offsets.insert(tp, OffsetAndMetadata::new(3));
    consumer.commit_sync(offsets).await.expect("commit");

    consumer.terminate().await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_poll_failure_is_fatal_and_propagates() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);

    let (consumer, controller) = string_consumer(&cluster, "fatal-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    controller.fail_next_poll(KafkaError::MessageConsumption(
        RDKafkaErrorCode::AllBrokersDown,
    ));

    let result = timeout(Duration::from_secs(5), consumer.await_termination())
        .await
        .expect("termination must be reported");
    assert!(matches!(result, Err(ConsumerError::Kafka(_))));
    assert!(controller.is_closed(), "client must be released on actor crash");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_operations_after_terminate_observe_shutdown() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);

    let (consumer, controller) = string_consumer(&cluster, "shutdown-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");
    consumer.terminate().await.expect("terminate");
    assert!(controller.is_closed());

    let subscribe = consumer.subscribe(&["t"]).await;
    assert!(matches!(subscribe, Err(ConsumerError::Shutdown)));

    let mut offsets = OffsetMap::new();
    offsets.insert(TopicPartition::new("t", 0), OffsetAndMetadata::new(1));
    let commit = consumer.commit_sync(offsets).await;
    assert!(matches!(commit, Err(ConsumerError::Shutdown)));

    let position = consumer.position(TopicPartition::new("t", 0)).await;
    assert!(matches!(position, Err(ConsumerError::Shutdown)));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_terminate_ends_streams_without_losing_handed_off_records() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    cluster.produce("t", 0, None, b"delivered");

    let (consumer, _controller) = string_consumer(&cluster, "terminate-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");

    let mut stream = Box::pin(consumer.stream());
    let record = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record")
        .expect("open")
        .expect("valid");
    assert_eq!(record.value(), "delivered");

    consumer.terminate().await.expect("terminate");

    // with the consumer gone, the stream completes instead of hanging
    let ended = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream should end after terminate");
    assert!(ended.is_none());
}
