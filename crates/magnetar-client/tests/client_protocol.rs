//! End-to-end client behavior against the in-process mock broker.

mod common;

use common::MockBroker;
use magnetar_client::{
    ClientConfig, CompressionType, ConsumerConfig, MagnetarClient, Message, MessageBuilder,
    ProducerConfig, ReaderConfig, MessageId, SubscriptionInitialPosition, SubscriptionType,
};
use std::time::{Duration, Instant};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn client_for(broker: &MockBroker) -> MagnetarClient {
    MagnetarClient::new(
        ClientConfig::builder()
            .service_url(broker.service_url())
            .operation_timeout(Duration::from_secs(5))
            .build(),
    )
    .unwrap()
}

async fn recv(consumer: &magnetar_client::Consumer) -> Message {
    tokio::time::timeout(RECV_TIMEOUT, consumer.recv())
        .await
        .expect("receive timed out")
        .expect("receive failed")
}

fn topic(name: &str) -> String {
    format!("persistent://public/default/{}", name)
}

#[tokio::test]
async fn test_basic_round_trip() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("round-trip");

    let consumer = client
        .subscribe(
            ConsumerConfig::builder(&topic, "e2e-sub")
                .acknowledgements_group_time(Duration::ZERO)
                .build(),
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();

    producer.send("hello").await.unwrap();

    let message = recv(&consumer).await;
    assert_eq!(&message.payload[..], b"hello");
    consumer.ack(&message).await.unwrap();

    producer.close().await.unwrap();
    consumer.close().await.unwrap();
}

#[tokio::test]
async fn test_key_and_properties_round_trip() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("key-props");

    let consumer = client
        .subscribe(ConsumerConfig::builder(&topic, "e2e-sub").build())
        .await
        .unwrap();
    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();

    producer
        .send(
            MessageBuilder::new("payload")
                .key("C#")
                .property("1", "one")
                .build(),
        )
        .await
        .unwrap();

    let message = recv(&consumer).await;
    assert_eq!(&message.payload[..], b"payload");
    assert_eq!(message.key.as_deref(), Some("C#"));
    assert_eq!(message.properties.get("1").map(String::as_str), Some("one"));
}

#[tokio::test]
async fn test_batch_of_ten_explodes_in_order() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("batch-ten");

    let consumer = client
        .subscribe(ConsumerConfig::builder(&topic, "e2e-sub").build())
        .await
        .unwrap();
    let producer = client
        .create_producer(
            ProducerConfig::builder(&topic)
                .batching_enabled(true)
                .max_messages_per_batch(10)
                .max_batching_publish_delay(Duration::from_secs(5))
                .build(),
        )
        .await
        .unwrap();

    let sends: Vec<_> = (0..10).map(|i| producer.send(format!("m{}", i))).collect();
    let ids: Vec<MessageId> = futures::future::join_all(sends)
        .await
        .into_iter()
        .collect::<Result<_, _>>()
        .unwrap();

    // One entry on the broker; ten sub-ids sharing it with distinct indexes.
    assert_eq!(broker.stored_entry_count(&topic), 1);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(id.ledger_id, ids[0].ledger_id);
        assert_eq!(id.entry_id, ids[0].entry_id);
        assert_eq!(id.batch_index(), Some(i as i32));
    }

    for i in 0..10 {
        let message = recv(&consumer).await;
        assert_eq!(message.payload, format!("m{}", i));
        assert_eq!(message.id.batch_index(), Some(i));
        assert_eq!(message.id.entry_id, ids[0].entry_id);
    }
}

#[tokio::test]
async fn test_partial_batch_sealed_by_publish_delay() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("batch-linger");

    let consumer = client
        .subscribe(ConsumerConfig::builder(&topic, "e2e-sub").build())
        .await
        .unwrap();
    let producer = client
        .create_producer(
            ProducerConfig::builder(&topic)
                .batching_enabled(true)
                .max_messages_per_batch(100)
                .max_batching_publish_delay(Duration::from_millis(20))
                .build(),
        )
        .await
        .unwrap();

    let sends: Vec<_> = (0..3).map(|i| producer.send(format!("m{}", i))).collect();
    futures::future::join_all(sends)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    for i in 0..3 {
        let message = recv(&consumer).await;
        assert_eq!(message.payload, format!("m{}", i));
    }
}

#[tokio::test]
async fn test_compressed_round_trip() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("compressed");

    let consumer = client
        .subscribe(ConsumerConfig::builder(&topic, "e2e-sub").build())
        .await
        .unwrap();
    let producer = client
        .create_producer(
            ProducerConfig::builder(&topic)
                .compression(CompressionType::Zstd)
                .build(),
        )
        .await
        .unwrap();

    let payload = "a payload repetitive enough to compress ".repeat(50);
    producer.send(payload.clone()).await.unwrap();

    let message = recv(&consumer).await;
    assert_eq!(message.payload, payload);
}

#[tokio::test]
async fn test_unacked_messages_redeliver_after_ack_timeout() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("ack-timeout");

    let consumer = client
        .subscribe(
            ConsumerConfig::builder(&topic, "e2e-sub")
                .ack_timeout(Duration::from_millis(200))
                .ack_timeout_tick_time(Duration::from_millis(20))
                .acknowledgements_group_time(Duration::ZERO)
                .build(),
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();

    for i in 0..3 {
        producer.send(format!("m{}", i)).await.unwrap();
    }

    let mut first_ids = Vec::new();
    for _ in 0..3 {
        first_ids.push(recv(&consumer).await.id.entry_id);
    }

    // No acks: every id must come back after the timeout.
    let mut redelivered = Vec::new();
    for _ in 0..3 {
        let message = recv(&consumer).await;
        assert!(message.redelivery_count > 0);
        redelivered.push(message.id.entry_id);
    }
    redelivered.sort_unstable();
    first_ids.sort_unstable();
    assert_eq!(redelivered, first_ids);
}

#[tokio::test]
async fn test_reader_seek_back_to_first() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("reader-seek");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    for i in 0..10 {
        producer.send(format!("m{}", i)).await.unwrap();
    }

    let reader = client
        .create_reader(ReaderConfig::builder(&topic, MessageId::earliest()).build())
        .await
        .unwrap();

    let mut first_pass = Vec::new();
    for _ in 0..10 {
        first_pass.push(tokio::time::timeout(RECV_TIMEOUT, reader.read_next())
            .await
            .unwrap()
            .unwrap());
    }

    reader.seek(first_pass[0].id.clone()).await.unwrap();

    // Exclusive seek: the target itself is filtered out.
    for expected in &first_pass[1..] {
        let message = tokio::time::timeout(RECV_TIMEOUT, reader.read_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, expected.payload);
    }
    assert!(!reader.has_message_available().await.unwrap());
}

#[tokio::test]
async fn test_reader_inclusive_seek() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("reader-seek-inclusive");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    for i in 0..10 {
        producer.send(format!("m{}", i)).await.unwrap();
    }

    let reader = client
        .create_reader(
            ReaderConfig::builder(&topic, MessageId::earliest())
                .start_message_id_inclusive(true)
                .build(),
        )
        .await
        .unwrap();

    let mut first_pass = Vec::new();
    for _ in 0..10 {
        first_pass.push(tokio::time::timeout(RECV_TIMEOUT, reader.read_next())
            .await
            .unwrap()
            .unwrap());
    }

    reader.seek(first_pass[0].id.clone()).await.unwrap();

    // Inclusive: all ten come back, the target included.
    for expected in &first_pass {
        let message = tokio::time::timeout(RECV_TIMEOUT, reader.read_next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.payload, expected.payload);
    }
}

#[tokio::test]
async fn test_key_shared_keys_stay_together() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("key-shared");

    let make_consumer = || async {
        client
            .subscribe(
                ConsumerConfig::builder(&topic, "ks-sub")
                    .subscription_type(SubscriptionType::KeyShared)
                    .build(),
            )
            .await
            .unwrap()
    };
    let consumer_a = make_consumer().await;
    let consumer_b = make_consumer().await;

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    for i in 0..3 {
        for key in ["A", "B"] {
            producer
                .send(
                    MessageBuilder::new(format!("{}{}", key, i))
                        .key(key)
                        .build(),
                )
                .await
                .unwrap();
        }
    }

    let drain = |consumer: magnetar_client::Consumer| async move {
        let mut messages = Vec::new();
        for _ in 0..3 {
            messages.push(recv(&consumer).await);
        }
        messages
    };
    let got_a = drain(consumer_a).await;
    let got_b = drain(consumer_b).await;

    // Each consumer sees exactly one key, in produce order.
    for messages in [&got_a, &got_b] {
        let key = messages[0].key.clone().unwrap();
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.key.as_deref(), Some(key.as_str()));
            assert_eq!(message.payload, format!("{}{}", key, i));
        }
    }
    assert_ne!(got_a[0].key, got_b[0].key);
}

#[tokio::test]
async fn test_reconnect_resends_pending_in_order() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("reconnect");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    // Prove the happy path first so the kill happens on a live session.
    producer.send("warmup").await.unwrap();

    broker.kill_connections();

    let sends: Vec<_> = (0..5).map(|i| producer.send(format!("m{}", i))).collect();
    let ids = futures::future::join_all(sends)
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    // All five made it exactly once, in order, with their original
    // (strictly increasing) sequence ids.
    assert_eq!(broker.stored_entry_count(&topic), 6);
    let stored = broker.stored_sequence_ids(&topic);
    assert!(stored.windows(2).all(|w| w[0] < w[1]));
    assert!(ids.windows(2).all(|w| w[0].entry_id < w[1].entry_id));
    // The producer re-registered after the drop.
    assert!(broker.producers_registered() >= 2);
}

#[tokio::test]
async fn test_negative_ack_redelivers_after_delay() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("negative-ack");

    let consumer = client
        .subscribe(
            ConsumerConfig::builder(&topic, "e2e-sub")
                .subscription_type(SubscriptionType::Shared)
                .negative_ack_redelivery_delay(Duration::from_millis(300))
                .build(),
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();

    producer.send("try-again").await.unwrap();
    let message = recv(&consumer).await;

    let nacked_at = Instant::now();
    consumer.negative_ack(&message).unwrap();

    let redelivered = recv(&consumer).await;
    assert!(nacked_at.elapsed() >= Duration::from_millis(300));
    assert_eq!(redelivered.payload, message.payload);
    assert_eq!(redelivered.id.entry_id, message.id.entry_id);
}

#[tokio::test]
async fn test_pending_ack_suppresses_duplicate_delivery() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("duplicates");

    let consumer = client
        .subscribe(
            ConsumerConfig::builder(&topic, "e2e-sub")
                .subscription_type(SubscriptionType::Shared)
                // Long group time: the ack stays pending client-side.
                .acknowledgements_group_time(Duration::from_secs(30))
                .build(),
        )
        .await
        .unwrap();
    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();

    producer.send("first").await.unwrap();
    producer.send("second").await.unwrap();

    let first = recv(&consumer).await;
    assert_eq!(first.payload, "first");
    consumer.ack(&first).await.unwrap();

    // The broker has not seen the ack, so it happily redelivers; the
    // client must recognize and drop the duplicate.
    consumer
        .redeliver_unacknowledged(vec![first.id.clone()])
        .await
        .unwrap();

    let second = recv(&consumer).await;
    assert_eq!(second.payload, "second");

    // Nothing else arrives: the duplicate of "first" was suppressed.
    let nothing = tokio::time::timeout(Duration::from_millis(300), consumer.recv()).await;
    assert!(nothing.is_err());
}

#[tokio::test]
async fn test_has_message_available_tracks_broker_tail() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("has-available");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    for i in 0..3 {
        producer.send(format!("m{}", i)).await.unwrap();
    }

    let reader = client
        .create_reader(ReaderConfig::builder(&topic, MessageId::earliest()).build())
        .await
        .unwrap();

    for _ in 0..3 {
        assert!(reader.has_message_available().await.unwrap());
        tokio::time::timeout(RECV_TIMEOUT, reader.read_next())
            .await
            .unwrap()
            .unwrap();
    }
    assert!(!reader.has_message_available().await.unwrap());

    producer.send("late").await.unwrap();
    assert!(reader.has_message_available().await.unwrap());
}

#[tokio::test]
async fn test_seek_by_timestamp() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("seek-time");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    for i in 0..5 {
        producer.send(format!("m{}", i)).await.unwrap();
    }

    let consumer = client
        .subscribe(
            ConsumerConfig::builder(&topic, "e2e-sub")
                .initial_position(SubscriptionInitialPosition::Earliest)
                .build(),
        )
        .await
        .unwrap();
    for _ in 0..5 {
        recv(&consumer).await;
    }

    // Everything was published after timestamp zero, so seeking there
    // replays the full log.
    consumer.seek_timestamp(0).await.unwrap();
    for i in 0..5 {
        let message = recv(&consumer).await;
        assert_eq!(message.payload, format!("m{}", i));
    }
}

#[tokio::test]
async fn test_unsubscribe_drops_subscription() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("unsubscribe");

    let consumer = client
        .subscribe(ConsumerConfig::builder(&topic, "e2e-sub").build())
        .await
        .unwrap();
    consumer.unsubscribe().await.unwrap();

    // The handle is dead afterwards.
    assert!(consumer.recv().await.is_err());
}

#[tokio::test]
async fn test_closed_producer_rejects_sends() {
    let broker = MockBroker::start().await;
    let client = client_for(&broker).await;
    let topic = topic("closed-producer");

    let producer = client
        .create_producer(ProducerConfig::builder(&topic).build())
        .await
        .unwrap();
    producer.close().await.unwrap();

    assert!(matches!(
        producer.send("too late").await,
        Err(magnetar_client::Error::AlreadyClosed)
    ));
}
