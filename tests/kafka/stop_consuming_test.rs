use super::mock_client::MockCluster;
use super::test_utils::{init, string_consumer, wait_for_assignment};
use futures::StreamExt;
use rillstream::{OffsetAndMetadata, OffsetMap, TopicPartition};
use std::time::Duration;
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_consuming_ends_streams_but_commits_still_complete() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    let tp = TopicPartition::new("t", 0);
    for i in 0..3 {
        cluster.produce("t", 0, None, format!("v{}", i).as_bytes());
    }

    let (consumer, _controller) = string_consumer(&cluster, "stop-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    let mut assignments = Box::pin(consumer.assignment_stream());
    let initial = timeout(Duration::from_secs(5), assignments.next())
        .await
        .expect("initial snapshot")
        .expect("stream open");
    assert!(!initial.is_empty());

    let mut stream = Box::pin(consumer.stream());
    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record")
        .expect("open")
        .expect("valid");
    assert_eq!(first.offset(), 0);

    consumer.stop_consuming().expect("stop consuming");

    // the assignment stream terminates within a bounded number of cycles
    let ended = timeout(Duration::from_secs(5), assignments.next())
        .await
        .expect("assignment stream should end");
    assert!(ended.is_none());

    // the record stream drains whatever was already handed off, then ends
    let drained = timeout(Duration::from_secs(5), async {
        let mut last_offset = first.offset();
        while let Some(item) = stream.next().await {
            last_offset = item.expect("valid record").offset();
        }
        last_offset
    })
    .await
    .expect("record stream should end");
    assert!(drained <= 2);

    // commits issued after stopConsuming still reach the broker
    let mut offsets = OffsetMap::new();
    offsets.insert(tp.clone(), OffsetAndMetadata::new(drained + 1));
    consumer.commit_sync(offsets).await.expect("commit after stop");
    assert_eq!(
        cluster.committed("stop-group").get(&tp).map(|o| o.offset),
        Some(drained + 1)
    );

    consumer.terminate().await.expect("terminate");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_consuming_is_monotonic_for_new_streams() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    cluster.produce("t", 0, None, b"ignored");

    let (consumer, _controller) = string_consumer(&cluster, "stopped-group");
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    consumer.stop_consuming().expect("stop consuming");
    tokio::time::sleep(Duration::from_millis(20)).await;

    // streams created after stopConsuming terminate immediately
    let mut stream = Box::pin(consumer.stream());
    let ended = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("stream should end");
    assert!(ended.is_none());

    let assignments = consumer.assignment_stream();
    let snapshot_then_end: Vec<_> = timeout(Duration::from_secs(5), assignments.collect::<Vec<_>>())
        .await
        .expect("assignment stream should end");
    // at most the bootstrap snapshot is observed
    assert!(snapshot_then_end.len() <= 1);

    consumer.terminate().await.expect("terminate");
}
