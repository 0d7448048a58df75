use crate::{Error, MemoryPubSub, SubscriptionState};

use async_trait::async_trait;
use proven_pubsub::{
    Connection, EnvelopeStream, ReceiveSettings, SubscriptionConfig, SubscriptionConfigToUpdate,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Connection to a [`MemoryPubSub`].
#[derive(Clone, Debug)]
pub struct MemoryConnection {
    service: MemoryPubSub,
    project_id: String,
    closed: CancellationToken,
}

impl MemoryConnection {
    pub(crate) fn new(service: MemoryPubSub, project_id: &str) -> Self {
        Self {
            service,
            project_id: project_id.to_string(),
            closed: CancellationToken::new(),
        }
    }

    /// Project the connection was opened for.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Whether the connection has been released.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }

        Ok(())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    type Error = Error;

    async fn subscription_exists(&self, subscription: &str) -> Result<bool, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.subscription_exists += 1);
        self.service.delay().await;

        Ok(self
            .service
            .state
            .lock()
            .subscriptions
            .contains_key(subscription))
    }

    async fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionConfig, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.create_subscription += 1);
        self.service.delay().await;

        let raced = self
            .service
            .take_fault(|f| &mut f.racing_subscription_creates);

        let mut state = self.service.state.lock();

        if !state.topics.contains(&config.topic) {
            return Err(Error::NotFound(config.topic.clone()));
        }

        if state.subscriptions.contains_key(subscription) {
            return Err(Error::AlreadyExists(subscription.to_string()));
        }

        state
            .subscriptions
            .insert(subscription.to_string(), SubscriptionState::new(config.clone()));

        if raced {
            debug!(subscription, "Subscription created by a concurrent caller");
            return Err(Error::AlreadyExists(subscription.to_string()));
        }

        Ok(config.clone())
    }

    async fn subscription_config(&self, subscription: &str) -> Result<SubscriptionConfig, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.subscription_config += 1);
        self.service.delay().await;

        self.service
            .subscription(subscription)
            .ok_or_else(|| Error::NotFound(subscription.to_string()))
    }

    async fn update_subscription(
        &self,
        subscription: &str,
        update: &SubscriptionConfigToUpdate,
    ) -> Result<SubscriptionConfig, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.update_subscription += 1);
        self.service.delay().await;

        let mut state = self.service.state.lock();
        let state = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::NotFound(subscription.to_string()))?;

        if let Some(push_config) = &update.push_config {
            state.config.push_config = push_config.clone();
        }
        if let Some(ack_deadline) = update.ack_deadline {
            state.config.ack_deadline = ack_deadline;
        }
        if let Some(labels) = &update.labels {
            state.config.labels = labels.clone();
        }

        Ok(state.config.clone())
    }

    async fn delete_subscription(&self, subscription: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.service.record(|c| c.delete_subscription += 1);
        self.service.delay().await;

        self.service
            .state
            .lock()
            .subscriptions
            .remove(subscription)
            .map(|_| ())
            .ok_or_else(|| Error::NotFound(subscription.to_string()))
    }

    async fn topic_exists(&self, topic: &str) -> Result<bool, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.topic_exists += 1);
        self.service.delay().await;

        Ok(self.service.has_topic(topic))
    }

    async fn create_topic(&self, topic: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.service.record(|c| c.create_topic += 1);
        self.service.delay().await;

        let raced = self.service.take_fault(|f| &mut f.racing_topic_creates);

        if self.service.has_topic(topic) {
            return Err(Error::AlreadyExists(topic.to_string()));
        }

        self.service.add_topic(topic);

        if raced {
            debug!(topic, "Topic created by a concurrent caller");
            return Err(Error::AlreadyExists(topic.to_string()));
        }

        Ok(())
    }

    async fn streaming_pull(
        &self,
        subscription: &str,
        _settings: &ReceiveSettings,
    ) -> Result<EnvelopeStream<Error>, Error> {
        self.ensure_open()?;
        self.service.record(|c| c.streaming_pulls += 1);

        if self.service.take_fault(|f| &mut f.failing_pulls) {
            return Err(Error::Unavailable(format!(
                "streaming pull on {subscription} failed"
            )));
        }

        let receiver = self
            .service
            .state
            .lock()
            .subscriptions
            .get(subscription)
            .map(|s| s.receiver.clone())
            .ok_or_else(|| Error::NotFound(subscription.to_string()))?;

        let service = self.service.clone();
        let closed = self.closed.clone();
        let subscription = subscription.to_string();

        let stream = async_stream::stream! {
            loop {
                let received = tokio::select! {
                    biased;
                    () = closed.cancelled() => break,
                    received = receiver.recv_async() => received,
                };

                // Disconnected once the subscription is deleted.
                let Ok(pending) = received else {
                    break;
                };

                if let Some(envelope) = service.dispatch(&subscription, pending) {
                    trace!(subscription, message_id = %envelope.message_id, "Delivering message");
                    yield Ok(envelope);
                }
            }
        };

        Ok(Box::pin(stream))
    }

    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.service.record(|c| c.acks += 1);

        let mut state = self.service.state.lock();
        let state = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::NotFound(subscription.to_string()))?;

        let pending = state
            .in_flight
            .remove(ack_id)
            .ok_or_else(|| Error::NotFound(ack_id.to_string()))?;

        state.acked.push(pending.message_id);

        Ok(())
    }

    async fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), Error> {
        self.ensure_open()?;
        self.service.record(|c| c.nacks += 1);

        let mut state = self.service.state.lock();
        let state = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| Error::NotFound(subscription.to_string()))?;

        let pending = state
            .in_flight
            .remove(ack_id)
            .ok_or_else(|| Error::NotFound(ack_id.to_string()))?;

        // Back of the queue.
        let _ = state.sender.send(pending);

        Ok(())
    }

    async fn close(&self) -> Result<(), Error> {
        self.service.record(|c| c.closes += 1);
        self.closed.cancel();

        if self.service.take_fault(|f| &mut f.failing_closes) {
            return Err(Error::Unavailable(format!(
                "closing connection to {} failed",
                self.project_id
            )));
        }

        debug!(project_id = %self.project_id, "Closed connection");

        Ok(())
    }
}
