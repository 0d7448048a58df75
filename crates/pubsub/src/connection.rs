use std::error::Error as StdError;
use std::fmt::Debug;

use async_trait::async_trait;
use futures::stream::BoxStream;
use parking_lot::Mutex;

use crate::descriptor::{ReceiveSettings, SubscriptionConfig, SubscriptionConfigToUpdate};
use crate::envelope::Envelope;

/// Marker trait for connection errors.
pub trait ConnectionError: Debug + StdError + Send + Sync + 'static {
    /// Whether a create call failed because the resource already exists.
    fn is_already_exists(&self) -> bool;
}

/// Envelopes delivered by a streaming pull. Ends when the service stops the stream.
pub type EnvelopeStream<E> = BoxStream<'static, Result<Envelope, E>>;

/// Opens connections to the service.
#[async_trait]
pub trait Connector
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The connection type produced.
    type Connection: Connection;

    /// Opens a new connection scoped to `project_id`.
    async fn connect(
        &self,
        project_id: &str,
    ) -> Result<Self::Connection, <Self::Connection as Connection>::Error>;
}

/// An open connection to the service.
///
/// All resource names are fully-qualified (see
/// [`qualified_topic_name`](crate::qualified_topic_name) and
/// [`qualified_subscription_name`](crate::qualified_subscription_name)).
#[async_trait]
pub trait Connection
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the connection.
    type Error: ConnectionError;

    /// Whether the subscription exists.
    async fn subscription_exists(&self, subscription: &str) -> Result<bool, Self::Error>;

    /// Creates a subscription and returns its effective descriptor.
    async fn create_subscription(
        &self,
        subscription: &str,
        config: &SubscriptionConfig,
    ) -> Result<SubscriptionConfig, Self::Error>;

    /// Fetches the descriptor of an existing subscription.
    async fn subscription_config(
        &self,
        subscription: &str,
    ) -> Result<SubscriptionConfig, Self::Error>;

    /// Applies a partial update and returns the updated descriptor.
    async fn update_subscription(
        &self,
        subscription: &str,
        update: &SubscriptionConfigToUpdate,
    ) -> Result<SubscriptionConfig, Self::Error>;

    /// Deletes a subscription.
    async fn delete_subscription(&self, subscription: &str) -> Result<(), Self::Error>;

    /// Whether the topic exists.
    async fn topic_exists(&self, topic: &str) -> Result<bool, Self::Error>;

    /// Creates a topic.
    async fn create_topic(&self, topic: &str) -> Result<(), Self::Error>;

    /// Opens a streaming pull on a subscription.
    async fn streaming_pull(
        &self,
        subscription: &str,
        settings: &ReceiveSettings,
    ) -> Result<EnvelopeStream<Self::Error>, Self::Error>;

    /// Acknowledges a delivery.
    async fn ack(&self, subscription: &str, ack_id: &str) -> Result<(), Self::Error>;

    /// Rejects a delivery so the service redelivers it.
    async fn nack(&self, subscription: &str, ack_id: &str) -> Result<(), Self::Error>;

    /// Releases the connection.
    async fn close(&self) -> Result<(), Self::Error>;
}

/// Every connection opened during the subscriber's lifetime.
#[derive(Debug)]
pub(crate) struct ConnectionSet<T>
where
    T: Connection,
{
    connections: Mutex<Vec<T>>,
}

impl<T> ConnectionSet<T>
where
    T: Connection,
{
    pub(crate) fn new() -> Self {
        Self {
            connections: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push(&self, connection: T) {
        self.connections.lock().push(connection);
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.connections.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.connections.lock().len()
    }
}
