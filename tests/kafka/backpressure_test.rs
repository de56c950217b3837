use super::mock_client::MockCluster;
use super::test_utils::{fast_config, init, string_consumer_with, wait_for_assignment};
use futures::StreamExt;
use rillstream::TopicPartition;
use std::time::Duration;
use tokio::time::timeout;

/// With `max_prefetch_batches = 2` and a slow downstream, the actor must
/// pause the partition instead of buffering without bound, and resume it
/// once demand returns. Every record is still delivered, in order.
#[tokio::test(flavor = "multi_thread")]
async fn test_slow_consumer_pauses_partition_and_loses_nothing() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    let tp = TopicPartition::new("t", 0);

    let config = fast_config("backpressure-group").max_prefetch_batches(2);
    let (consumer, controller) = string_consumer_with(&cluster, "backpressure-group", config);
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    let mut stream = Box::pin(consumer.stream());

    // a slow downstream: 40ms per record against 2ms poll cycles
    let total = 15;
    let mut delivered = Vec::new();
    for batch in 0..3 {
        for i in 0..5 {
            cluster.produce("t", 0, None, format!("r{}", batch * 5 + i).as_bytes());
        }
        // let several poll cycles run while downstream is stalled
        tokio::time::sleep(Duration::from_millis(40)).await;
        let record = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("record within deadline")
            .expect("stream open")
            .expect("valid record");
        delivered.push(record.offset());
    }

    assert!(
        controller.is_paused(&tp) || !controller.pause_log().is_empty(),
        "the partition must have been paused while the downstream lagged"
    );

    while delivered.len() < total {
        let record = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("record within deadline")
            .expect("stream open")
            .expect("valid record");
        delivered.push(record.offset());
    }

    assert_eq!(delivered, (0..total as i64).collect::<Vec<i64>>());
    assert!(
        !controller.resume_log().is_empty(),
        "the partition must have been resumed once demand returned"
    );
    assert!(
        !controller.is_paused(&tp),
        "fully drained partition should not stay paused"
    );

    consumer.terminate().await.expect("terminate");
}

/// With `max_prefetch_batches = 1` there is no prefetch at all: while the
/// one in-flight chunk has not been consumed, no fetch is outstanding, so
/// any records arriving in the meantime must pause the partition.
#[tokio::test(flavor = "multi_thread")]
async fn test_single_prefetch_batch_pauses_while_chunk_unconsumed() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    let tp = TopicPartition::new("t", 0);

    let config = fast_config("no-prefetch-group").max_prefetch_batches(1);
    let (consumer, controller) = string_consumer_with(&cluster, "no-prefetch-group", config);
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    let mut stream = Box::pin(consumer.stream());

    // first chunk: delivered and taken, so the next fetch goes out
    for i in 0..3 {
        cluster.produce("t", 0, None, format!("a{}", i).as_bytes());
    }
    let first = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("record within deadline")
        .expect("stream open")
        .expect("valid record");
    assert_eq!(first.offset(), 0);

    // second chunk: completes the outstanding fetch and fills the single
    // slot; it is never taken, so no further fetch is issued
    for i in 0..3 {
        cluster.produce("t", 0, None, format!("b{}", i).as_bytes());
    }
    tokio::time::sleep(Duration::from_millis(40)).await;

    // third batch arrives with the in-flight chunk unconsumed: the actor
    // must pause the partition rather than keep fetching
    for i in 0..3 {
        cluster.produce("t", 0, None, format!("c{}", i).as_bytes());
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !controller.is_paused(&tp) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "partition must be paused while the in-flight chunk is unconsumed"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // demand returns: everything is delivered in order and the partition
    // is resumed
    let mut offsets = vec![first.offset()];
    while offsets.len() < 9 {
        let record = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("record within deadline")
            .expect("stream open")
            .expect("valid record");
        offsets.push(record.offset());
    }
    assert_eq!(offsets, (0..9).collect::<Vec<i64>>());
    assert!(
        !controller.resume_log().is_empty(),
        "paused partition must be resumed once the chunk is consumed"
    );
    assert!(!controller.is_paused(&tp));

    consumer.terminate().await.expect("terminate");
}

/// Records that arrive while no fetch is outstanding are buffered once and
/// flushed to the next fetch; the client is paused in between.
#[tokio::test(flavor = "multi_thread")]
async fn test_records_before_first_demand_are_buffered_then_flushed() {
    init();
    let cluster = MockCluster::new();
    cluster.create_topic("t", 1);
    let tp = TopicPartition::new("t", 0);
    for i in 0..5 {
        cluster.produce("t", 0, None, format!("early{}", i).as_bytes());
    }

    let (consumer, controller) = string_consumer_with(
        &cluster,
        "prefetch-group",
        fast_config("prefetch-group").max_prefetch_batches(2),
    );
    consumer.subscribe(&["t"]).await.expect("subscribe");
    wait_for_assignment(&consumer, 1).await;

    // no stream is consuming yet: the poll cycle must park the partition
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !controller.is_paused(&tp) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "partition with unconsumed buffer was never paused"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut stream = Box::pin(consumer.stream());
    let mut values = Vec::new();
    for _ in 0..5 {
        let record = timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("record within deadline")
            .expect("stream open")
            .expect("valid record");
        values.push(record.value().clone());
    }
    assert_eq!(
        values,
        (0..5).map(|i| format!("early{}", i)).collect::<Vec<String>>()
    );
    assert!(
        !controller.resume_log().is_empty(),
        "buffered partition must be resumed when demand arrives"
    );

    consumer.terminate().await.expect("terminate");
}
