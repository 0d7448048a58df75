use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, error, info, info_span};

use crate::config::{ResolvedConfig, SubscriberConfig};
use crate::connection::{Connection, ConnectionSet, Connector};
use crate::delivery::DeliveryLoop;
use crate::error::{BoxError, Error};
use crate::message::Message;
use crate::resolver::{SubscriptionHandle, SubscriptionResolver};
use crate::retry::retry_until_shutdown;
use crate::shutdown::ShutdownSignal;

/// Stream of messages produced by [`Subscriber::subscribe`].
///
/// Rendezvous semantics: a message is only handed out once the consumer asks for
/// it. The stream ends when the subscription stops.
pub type MessageStream = flume::Receiver<Message>;

/// Consumes messages from topics through durable, named subscriptions.
///
/// Cheap to clone: clones share subscriptions, connections and shutdown.
#[derive(Debug)]
pub struct Subscriber<C>
where
    C: Connector,
{
    inner: Arc<SubscriberInner<C>>,
}

#[derive(Debug)]
struct SubscriberInner<C>
where
    C: Connector,
{
    config: Arc<ResolvedConfig>,
    resolver: SubscriptionResolver<C>,
    connections: Arc<ConnectionSet<C::Connection>>,
    shutdown: Arc<ShutdownSignal>,
    tasks: TaskTracker,
}

impl<C> Clone for Subscriber<C>
where
    C: Connector,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C> Subscriber<C>
where
    C: Connector,
{
    /// Creates a subscriber. No connection is opened until the first subscription.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: SubscriberConfig, connector: C) -> Result<Self, Error> {
        let config = Arc::new(ResolvedConfig::try_from(config)?);
        let connections = Arc::new(ConnectionSet::new());
        let shutdown = Arc::new(ShutdownSignal::new());

        let resolver = SubscriptionResolver::new(
            config.clone(),
            connector,
            connections.clone(),
            shutdown.clone(),
        );

        Ok(Self {
            inner: Arc::new(SubscriberInner {
                config,
                resolver,
                connections,
                shutdown,
                tasks: TaskTracker::new(),
            }),
        })
    }

    /// Subscribes to `topic`, creating the topic and subscription as configured.
    ///
    /// Messages stop flowing when `context` is cancelled, when the returned stream is
    /// dropped, or when the subscriber is closed. Receive failures are retried with
    /// backoff for as long as the subscriber is open.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close),
    /// [`Error::Cancelled`] if `context` is cancelled during resolution, or the
    /// resolution error otherwise.
    pub async fn subscribe(
        &self,
        context: &CancellationToken,
        topic: &str,
    ) -> Result<MessageStream, Error> {
        if self.inner.shutdown.is_closed() {
            return Err(Error::Closed);
        }

        let subscription_name = self.subscription_name(topic)?;
        let span = info_span!("subscription", topic, subscription = %subscription_name);

        let token = context.child_token();

        info!(parent: &span, "Subscribing to topic");

        let handle = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled(subscription_name)),
            resolved = self
                .inner
                .resolver
                .resolve(&subscription_name, topic)
                .instrument(span.clone()) => resolved?,
        };

        let (output, messages) = flume::bounded(0);
        let delivery = DeliveryLoop::new(
            handle,
            self.inner.config.unmarshaler.clone(),
            self.inner.shutdown.token().clone(),
            output,
        );

        let started = self
            .inner
            .shutdown
            .unless_closed(|| self.spawn_subscription(token, delivery, &span));

        if started.is_none() {
            return Err(Error::Closed);
        }

        info!(parent: &span, "Subscribed to topic");

        Ok(messages)
    }

    fn spawn_subscription(
        &self,
        token: CancellationToken,
        delivery: DeliveryLoop<C::Connection>,
        span: &tracing::Span,
    ) {
        let shutdown = self.inner.shutdown.clone();

        self.inner.tasks.spawn({
            let shutdown = shutdown.clone();
            let token = token.clone();

            async move {
                tokio::select! {
                    () = shutdown.token().cancelled() => {
                        debug!("Closing message consumer");
                        token.cancel();
                    }
                    () = token.cancelled() => {}
                }
            }
            .instrument(span.clone())
        });

        let backoff = self.inner.config.backoff;

        self.inner.tasks.spawn(
            async move {
                let result =
                    retry_until_shutdown(backoff, &shutdown, || delivery.run(&token)).await;

                if let Err(error) = result {
                    error!(%error, "Retrying receiving messages failed");
                }

                token.cancel();
                drop(delivery);

                debug!("Message stream closed");
            }
            .instrument(span.clone()),
        );
    }

    /// Resolves the subscription for `topic` without starting delivery.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Closed`] after [`close`](Self::close), or the resolution error.
    pub async fn resolve(&self, topic: &str) -> Result<SubscriptionHandle<C::Connection>, Error> {
        if self.inner.shutdown.is_closed() {
            return Err(Error::Closed);
        }

        let subscription_name = self.subscription_name(topic)?;

        self.inner
            .resolver
            .resolve(&subscription_name, topic)
            .instrument(info_span!("subscription", topic, subscription = %subscription_name))
            .await
    }

    /// Prepares the topic and subscription ahead of time, bounded by the
    /// configured initialize timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InitializeTimeout`] if resolution takes too long,
    /// [`Error::Closed`] after [`close`](Self::close), or the resolution error.
    pub async fn initialize(&self, topic: &str) -> Result<(), Error> {
        let timeout = self.inner.config.initialize_timeout;

        debug!(topic, ?timeout, "Initializing subscription");

        match tokio::time::timeout(timeout, self.resolve(topic)).await {
            Ok(resolved) => resolved.map(|_| ()),
            Err(_) => Err(Error::InitializeTimeout {
                subscription: self.subscription_name(topic)?,
                timeout,
            }),
        }
    }

    /// Stops every subscription, waits for in-flight messages to be settled,
    /// then closes every connection ever opened.
    ///
    /// Idempotent: only the first call does anything.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Close`] carrying every connection close failure.
    pub async fn close(&self) -> Result<(), Error> {
        if !self.inner.shutdown.trigger() {
            return Ok(());
        }

        debug!("Closing subscriber");

        self.inner.tasks.close();
        self.inner.tasks.wait().await;

        let _resolutions = self.inner.resolver.quiesce().await;

        let mut failures: Vec<BoxError> = Vec::new();
        for connection in self.inner.connections.drain() {
            if let Err(error) = connection.close().await {
                failures.push(Box::new(error));
            }
        }

        if !failures.is_empty() {
            error!(count = failures.len(), "Failed to close connections");
            return Err(Error::Close(failures));
        }

        info!("Subscriber closed");

        Ok(())
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_closed()
    }

    /// Number of connections opened and not yet closed.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn subscription_name(&self, topic: &str) -> Result<String, Error> {
        let subscription_name = self.inner.config.generate_subscription_name.generate(topic);

        if subscription_name.is_empty() {
            return Err(Error::Config(format!(
                "empty subscription name generated for topic {topic}"
            )));
        }

        Ok(subscription_name)
    }
}
