#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use proven_pubsub::{
    BackoffConfig, DefaultMarshalerUnmarshaler, Marshaler, Message, MessageStream,
    SubscriberConfig, SubscriptionConfig,
};
use proven_pubsub_memory::MemoryPubSub;

pub const PROJECT: &str = "acme";

pub fn topic_name(topic: &str) -> String {
    format!("projects/{PROJECT}/topics/{topic}")
}

pub fn subscription_name(subscription: &str) -> String {
    format!("projects/{PROJECT}/subscriptions/{subscription}")
}

pub fn config() -> SubscriberConfig {
    SubscriberConfig {
        project_id: PROJECT.to_string(),
        backoff: BackoffConfig {
            initial_interval: Duration::from_millis(5),
            max_interval: Duration::from_millis(20),
            multiplier: 2.0,
            randomization_factor: 0.0,
        },
        ..Default::default()
    }
}

/// Seeds a topic and a subscription bound to it.
pub fn seed(service: &MemoryPubSub, topic: &str, subscription: &str, config: SubscriptionConfig) {
    service.add_topic(topic_name(topic));
    service.add_subscription(
        subscription_name(subscription),
        SubscriptionConfig {
            topic: topic_name(topic),
            ..config
        },
    );
}

/// Publishes `payload` through the default codec and returns the message id.
pub fn publish(service: &MemoryPubSub, topic: &str, uuid: &str, payload: &'static str) -> String {
    let message = Message::new(uuid, Bytes::from_static(payload.as_bytes()));
    let outgoing = DefaultMarshalerUnmarshaler
        .marshal(topic, &message)
        .expect("Failed to marshal message");

    service
        .publish(&topic_name(topic), outgoing)
        .expect("Failed to publish")
}

pub async fn receive(messages: &MessageStream) -> Message {
    tokio::time::timeout(Duration::from_secs(5), messages.recv_async())
        .await
        .expect("Timeout waiting for message")
        .expect("Message stream closed")
}

/// Polls `condition` until it holds or a few seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    panic!("Condition not met in time");
}
