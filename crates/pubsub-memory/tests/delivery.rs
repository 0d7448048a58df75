//! Integration tests for message delivery and subscriber lifecycle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use common::{config, eventually, publish, receive, seed, subscription_name, topic_name};
use proven_pubsub::{
    BoxError, Connection, Connector, Error, Message, OrderingUnmarshaler, Outcome, Subscriber,
    SubscriberConfig, SubscriptionConfig, codec::MESSAGE_ID_HEADER_KEY,
};
use proven_pubsub_memory::MemoryPubSub;
use tokio_util::sync::CancellationToken;

fn seeded() -> MemoryPubSub {
    let service = MemoryPubSub::new();
    seed(&service, "orders", "orders", SubscriptionConfig::default());
    service
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_acked_message_is_acked_once() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    let message_id = publish(&service, "orders", "order-1", "hello");

    let message = receive(&messages).await;
    assert_eq!(message.uuid, "order-1");
    assert_eq!(message.payload, "hello".as_bytes());
    assert_eq!(
        message.metadata_value(MESSAGE_ID_HEADER_KEY),
        Some(message_id.as_str())
    );

    assert!(message.ack());
    assert!(!message.ack());
    assert!(!message.nack());
    assert_eq!(message.outcome(), Some(Outcome::Acked));

    let acked_id = message_id.clone();
    eventually(|| service.acked(&subscription_name("orders")) == vec![acked_id.clone()]).await;

    let counts = service.counts();
    assert_eq!(counts.acks, 1);
    assert_eq!(counts.nacks, 0);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_nacked_message_is_redelivered() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    publish(&service, "orders", "order-1", "hello");

    let first = receive(&messages).await;
    assert!(first.nack());
    assert!(!first.ack());

    let second = receive(&messages).await;
    assert_eq!(second.uuid, "order-1");
    assert!(second.ack());

    eventually(|| service.acked(&subscription_name("orders")).len() == 1).await;

    let counts = service.counts();
    assert_eq!(counts.nacks, 1);
    assert_eq!(counts.acks, 1);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_dropped_message_is_nacked() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    publish(&service, "orders", "order-1", "hello");

    drop(receive(&messages).await);

    let redelivered = receive(&messages).await;
    assert_eq!(redelivered.uuid, "order-1");
    assert!(redelivered.ack());

    eventually(|| service.counts().acks == 1).await;
    assert_eq!(service.counts().nacks, 1);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_message_context_nacks_and_delivery_continues() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    publish(&service, "orders", "order-1", "first");

    let abandoned = receive(&messages).await;
    abandoned.context().cancel();

    eventually(|| service.counts().nacks == 1).await;

    publish(&service, "orders", "order-2", "second");

    let mut seen = Vec::new();
    for _ in 0..2 {
        let message = receive(&messages).await;
        seen.push(message.uuid.clone());
        assert!(message.ack());
    }
    seen.sort();

    assert_eq!(seen, vec!["order-1", "order-2"]);
    eventually(|| service.acked(&subscription_name("orders")).len() == 2).await;

    // Deciding after the context was cancelled changes nothing upstream.
    assert!(abandoned.ack());
    assert_eq!(service.counts().acks, 2);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_undecodable_message_is_nacked() {
    let service = seeded();
    let subscriber = Subscriber::new(
        SubscriberConfig {
            unmarshaler: Some(Arc::new(OrderingUnmarshaler::new(
                |_key: &str, message: &Message| -> Result<(), BoxError> {
                    if message.uuid == "poison" {
                        return Err("rejected".into());
                    }
                    Ok(())
                },
            ))),
            ..config()
        },
        service.clone(),
    )
    .unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    publish(&service, "orders", "poison", "bad");

    eventually(|| service.counts().nacks >= 1).await;

    publish(&service, "orders", "order-1", "good");

    let message = receive(&messages).await;
    assert_eq!(message.uuid, "order-1");
    assert!(message.ack());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_receive_failures_are_retried() {
    let service = seeded();
    service.fail_next_pulls(3);

    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    publish(&service, "orders", "order-1", "hello");

    let message = receive(&messages).await;
    assert!(message.ack());

    assert_eq!(service.counts().streaming_pulls, 4);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_deleted_subscription_ends_stream() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();

    eventually(|| service.counts().streaming_pulls == 1).await;

    let admin = service.connect("acme").await.unwrap();
    admin
        .delete_subscription(&subscription_name("orders"))
        .await
        .unwrap();

    // A pull that ends without an error is not retried.
    let ended = tokio::time::timeout(Duration::from_secs(5), messages.recv_async()).await;
    assert_matches!(ended, Ok(Err(flume::RecvError::Disconnected)));
    assert_eq!(service.counts().streaming_pulls, 1);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_cancelled_context_ends_stream() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();

    context.cancel();

    let ended = tokio::time::timeout(Duration::from_secs(5), messages.recv_async()).await;
    assert_matches!(ended, Ok(Err(flume::RecvError::Disconnected)));

    // The subscriber itself stays usable.
    let messages = subscriber
        .subscribe(&CancellationToken::new(), "orders")
        .await
        .unwrap();
    publish(&service, "orders", "order-1", "hello");
    assert!(receive(&messages).await.ack());

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_dropping_stream_stops_subscription() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();
    drop(messages);

    publish(&service, "orders", "order-1", "hello");

    eventually(|| service.counts().nacks == 1).await;
    eventually(|| service.in_flight(&subscription_name("orders")) == 0).await;

    subscriber.close().await.unwrap();
    assert_eq!(service.backlog(&subscription_name("orders")), 1);
}

#[tokio::test]
async fn test_cancelled_context_aborts_resolution() {
    let service = MemoryPubSub::new();
    service.set_latency(Duration::from_secs(5));
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let subscribing = {
        let subscriber = subscriber.clone();
        let context = context.clone();
        tokio::spawn(async move { subscriber.subscribe(&context, "orders").await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    context.cancel();

    let result = tokio::time::timeout(Duration::from_secs(1), subscribing)
        .await
        .expect("Timeout waiting for subscribe")
        .unwrap();

    assert_matches!(result, Err(Error::Cancelled(name)) if name == "orders");

    subscriber.close().await.unwrap();
}

#[tracing_test::traced_test]
#[tokio::test]
async fn test_close_ends_streams_and_releases_connections() {
    let service = seeded();
    seed(&service, "payments", "payments", SubscriptionConfig::default());
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let orders = subscriber.subscribe(&context, "orders").await.unwrap();
    let payments = subscriber.subscribe(&context, "payments").await.unwrap();

    publish(&service, "orders", "order-1", "hello");
    let undecided = receive(&orders).await;

    subscriber.close().await.unwrap();

    assert!(subscriber.is_closed());
    assert_matches!(orders.recv_async().await, Err(flume::RecvError::Disconnected));
    assert_matches!(payments.recv_async().await, Err(flume::RecvError::Disconnected));
    assert!(undecided.context().is_cancelled());

    let counts = service.counts();
    assert_eq!(counts.connects, 2);
    assert_eq!(counts.closes, 2);
    assert_eq!(counts.nacks, 1);
    assert_eq!(subscriber.connection_count(), 0);

    // Settling after close is a no-op upstream.
    undecided.ack();
    assert_eq!(service.counts().acks, 0);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();

    subscriber
        .subscribe(&CancellationToken::new(), "orders")
        .await
        .unwrap();

    subscriber.close().await.unwrap();
    subscriber.close().await.unwrap();

    assert_eq!(service.counts().closes, 1);
}

#[tokio::test]
async fn test_close_reports_every_failed_release() {
    let service = seeded();
    seed(&service, "payments", "payments", SubscriptionConfig::default());
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    subscriber.subscribe(&context, "orders").await.unwrap();
    subscriber.subscribe(&context, "payments").await.unwrap();

    service.fail_next_closes(2);

    let result = subscriber.close().await;

    assert_matches!(&result, Err(Error::Close(failures)) if failures.len() == 2);
    assert!(
        result
            .unwrap_err()
            .to_string()
            .starts_with("unable to close 2 connection(s)")
    );
    assert_eq!(service.counts().closes, 2);

    subscriber.close().await.unwrap();
}

#[tokio::test]
async fn test_subscriber_is_unusable_after_close() {
    let service = MemoryPubSub::new();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();

    subscriber.close().await.unwrap();

    assert_matches!(
        subscriber
            .subscribe(&CancellationToken::new(), "orders")
            .await,
        Err(Error::Closed)
    );
    assert_matches!(subscriber.initialize("orders").await, Err(Error::Closed));
    assert_matches!(subscriber.resolve("orders").await, Err(Error::Closed));

    let counts = service.counts();
    assert_eq!(counts.connects, 0);
    assert_eq!(counts.admin_calls(), 0);
}

#[tokio::test]
async fn test_messages_are_settled_concurrently() {
    let service = seeded();
    let subscriber = Subscriber::new(config(), service.clone()).unwrap();
    let context = CancellationToken::new();

    let messages = subscriber.subscribe(&context, "orders").await.unwrap();

    for uuid in ["order-1", "order-2", "order-3"] {
        publish(&service, "orders", uuid, "hello");
    }

    // Hold every message before deciding any of them.
    let mut held = Vec::new();
    for _ in 0..3 {
        held.push(receive(&messages).await);
    }
    assert_eq!(service.in_flight(&subscription_name("orders")), 3);

    for message in held.iter().rev() {
        assert!(message.ack());
    }

    eventually(|| service.acked(&subscription_name("orders")).len() == 3).await;

    subscriber.close().await.unwrap();
    assert_eq!(service.counts().nacks, 0);
    assert!(service.has_topic(&topic_name("orders")));
}
