//! In-memory (single process) emulation of the pub/sub service for local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod connection;
mod error;

pub use connection::MemoryConnection;
pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use proven_pubsub::{Connector, Envelope, OutgoingMessage, SubscriptionConfig};
use tracing::debug;

/// Number of calls made against the service, per operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OperationCounts {
    /// Connections opened.
    pub connects: usize,
    /// Connection close calls, including failed ones.
    pub closes: usize,
    /// Subscription existence checks.
    pub subscription_exists: usize,
    /// Subscription create calls.
    pub create_subscription: usize,
    /// Subscription descriptor fetches.
    pub subscription_config: usize,
    /// Subscription updates.
    pub update_subscription: usize,
    /// Subscription deletions.
    pub delete_subscription: usize,
    /// Topic existence checks.
    pub topic_exists: usize,
    /// Topic create calls.
    pub create_topic: usize,
    /// Streaming pulls opened, including failed ones.
    pub streaming_pulls: usize,
    /// Acks received.
    pub acks: usize,
    /// Nacks received.
    pub nacks: usize,
}

impl OperationCounts {
    /// Calls that inspect or change topics and subscriptions.
    #[must_use]
    pub const fn admin_calls(&self) -> usize {
        self.subscription_exists
            + self.create_subscription
            + self.subscription_config
            + self.update_subscription
            + self.delete_subscription
            + self.topic_exists
            + self.create_topic
    }
}

#[derive(Clone, Debug)]
struct Pending {
    message_id: String,
    data: Bytes,
    attributes: HashMap<String, String>,
    ordering_key: String,
    publish_time: SystemTime,
    attempts: u32,
}

#[derive(Debug)]
struct SubscriptionState {
    config: SubscriptionConfig,
    sender: flume::Sender<Pending>,
    receiver: flume::Receiver<Pending>,
    in_flight: HashMap<String, Pending>,
    acked: Vec<String>,
}

impl SubscriptionState {
    fn new(config: SubscriptionConfig) -> Self {
        let (sender, receiver) = flume::unbounded();

        Self {
            config,
            sender,
            receiver,
            in_flight: HashMap::new(),
            acked: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    failing_pulls: usize,
    failing_closes: usize,
    racing_subscription_creates: usize,
    racing_topic_creates: usize,
    latency: Duration,
}

#[derive(Debug, Default)]
struct State {
    topics: Vec<String>,
    subscriptions: HashMap<String, SubscriptionState>,
    counts: OperationCounts,
    faults: Faults,
}

/// In-memory pub/sub service.
///
/// Clones share state. Acts as the [`Connector`] for the subscriber: every
/// connection it hands out operates on the same topics and subscriptions.
#[derive(Clone, Debug, Default)]
pub struct MemoryPubSub {
    state: Arc<Mutex<State>>,
    next_message_id: Arc<AtomicU64>,
}

impl MemoryPubSub {
    /// Creates an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a topic directly, bypassing counters and fault injection.
    pub fn add_topic(&self, topic: impl Into<String>) {
        let topic = topic.into();
        let mut state = self.state.lock();

        if !state.topics.contains(&topic) {
            state.topics.push(topic);
        }
    }

    /// Creates a subscription directly, bypassing counters and fault injection.
    pub fn add_subscription(&self, subscription: impl Into<String>, config: SubscriptionConfig) {
        self.state
            .lock()
            .subscriptions
            .insert(subscription.into(), SubscriptionState::new(config));
    }

    /// Publishes a message to every subscription bound to `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the topic does not exist.
    pub fn publish(&self, topic: &str, message: OutgoingMessage) -> Result<String, Error> {
        let state = self.state.lock();

        if !state.topics.iter().any(|t| t == topic) {
            return Err(Error::NotFound(topic.to_string()));
        }

        let message_id = self
            .next_message_id
            .fetch_add(1, Ordering::SeqCst)
            .to_string();

        let pending = Pending {
            message_id: message_id.clone(),
            data: message.data,
            attributes: message.attributes,
            ordering_key: message.ordering_key,
            publish_time: SystemTime::now(),
            attempts: 0,
        };

        for subscription in state
            .subscriptions
            .values()
            .filter(|s| s.config.topic == topic && !s.config.detached)
        {
            let _ = subscription.sender.send(pending.clone());
        }

        debug!(topic, %message_id, "Published message");

        Ok(message_id)
    }

    /// Descriptor of a subscription, if it exists.
    #[must_use]
    pub fn subscription(&self, subscription: &str) -> Option<SubscriptionConfig> {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.config.clone())
    }

    /// Whether the topic exists.
    #[must_use]
    pub fn has_topic(&self, topic: &str) -> bool {
        self.state.lock().topics.iter().any(|t| t == topic)
    }

    /// Message ids acked on a subscription, in ack order.
    #[must_use]
    pub fn acked(&self, subscription: &str) -> Vec<String> {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.acked.clone())
            .unwrap_or_default()
    }

    /// Messages delivered on a subscription and not yet acked or nacked.
    #[must_use]
    pub fn in_flight(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.in_flight.len())
    }

    /// Messages waiting for delivery on a subscription.
    #[must_use]
    pub fn backlog(&self, subscription: &str) -> usize {
        self.state
            .lock()
            .subscriptions
            .get(subscription)
            .map_or(0, |s| s.receiver.len())
    }

    /// Snapshot of the operation counters.
    #[must_use]
    pub fn counts(&self) -> OperationCounts {
        self.state.lock().counts
    }

    /// Makes the next `count` streaming pulls fail.
    pub fn fail_next_pulls(&self, count: usize) {
        self.state.lock().faults.failing_pulls = count;
    }

    /// Makes the next `count` connection closes fail.
    pub fn fail_next_closes(&self, count: usize) {
        self.state.lock().faults.failing_closes = count;
    }

    /// Makes the next subscription create lose a race: the subscription is
    /// created as requested, but the call reports that it already exists.
    pub fn race_next_subscription_create(&self) {
        self.state.lock().faults.racing_subscription_creates += 1;
    }

    /// Makes the next topic create lose a race, as for subscriptions.
    pub fn race_next_topic_create(&self) {
        self.state.lock().faults.racing_topic_creates += 1;
    }

    /// Delays every topic and subscription operation by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().faults.latency = latency;
    }

    fn record(&self, count: impl FnOnce(&mut OperationCounts)) {
        count(&mut self.state.lock().counts);
    }

    async fn delay(&self) {
        let latency = self.state.lock().faults.latency;

        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_fault(&self, fault: impl FnOnce(&mut Faults) -> &mut usize) -> bool {
        let mut state = self.state.lock();
        let remaining = fault(&mut state.faults);

        if *remaining == 0 {
            return false;
        }

        *remaining -= 1;
        true
    }

    fn dispatch(&self, subscription: &str, mut pending: Pending) -> Option<Envelope> {
        let mut state = self.state.lock();
        let subscription = state.subscriptions.get_mut(subscription)?;

        pending.attempts += 1;
        let ack_id = uuid::Uuid::new_v4().to_string();

        let envelope = Envelope {
            ack_id: ack_id.clone(),
            message_id: pending.message_id.clone(),
            data: pending.data.clone(),
            attributes: pending.attributes.clone(),
            ordering_key: pending.ordering_key.clone(),
            publish_time: pending.publish_time,
            delivery_attempt: subscription
                .config
                .dead_letter_policy
                .is_some()
                .then_some(pending.attempts),
        };

        subscription.in_flight.insert(ack_id, pending);

        Some(envelope)
    }
}

#[async_trait]
impl Connector for MemoryPubSub {
    type Connection = MemoryConnection;

    async fn connect(&self, project_id: &str) -> Result<MemoryConnection, Error> {
        self.record(|c| c.connects += 1);

        debug!(project_id, "Opened connection");

        Ok(MemoryConnection::new(self.clone(), project_id))
    }
}
