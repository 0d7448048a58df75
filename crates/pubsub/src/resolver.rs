use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, RwLockWriteGuard};
use tracing::{debug, info};

use crate::config::ResolvedConfig;
use crate::connection::{Connection, ConnectionError, ConnectionSet, Connector};
use crate::descriptor::{
    ReceiveSettings, SubscriptionConfig, SubscriptionConfigToUpdate, qualified_subscription_name,
    qualified_topic_name,
};
use crate::error::Error;
use crate::shutdown::ShutdownSignal;

/// A provisioned subscription, bound to exactly one topic.
///
/// Handles are cached per subscription name: every resolution of the same name
/// within a subscriber returns a clone of the same handle.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle<T>
where
    T: Connection,
{
    inner: Arc<HandleInner<T>>,
}

#[derive(Debug)]
struct HandleInner<T>
where
    T: Connection,
{
    name: String,
    qualified_name: String,
    topic: String,
    descriptor: SubscriptionConfig,
    receive_settings: ReceiveSettings,
    connection: T,
}

impl<T> SubscriptionHandle<T>
where
    T: Connection,
{
    fn new(
        name: String,
        qualified_name: String,
        topic: String,
        descriptor: SubscriptionConfig,
        receive_settings: ReceiveSettings,
        connection: T,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                name,
                qualified_name,
                topic,
                descriptor,
                receive_settings,
                connection,
            }),
        }
    }

    /// Subscription name as generated from the topic.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Fully-qualified subscription name.
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.inner.qualified_name
    }

    /// Fully-qualified name of the bound topic.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Remote descriptor as of resolution.
    #[must_use]
    pub fn descriptor(&self) -> &SubscriptionConfig {
        &self.inner.descriptor
    }

    /// Receive settings fixed at resolution.
    #[must_use]
    pub fn receive_settings(&self) -> &ReceiveSettings {
        &self.inner.receive_settings
    }

    /// Connection the subscription was resolved on.
    #[must_use]
    pub fn connection(&self) -> &T {
        &self.inner.connection
    }

    /// Whether both handles refer to the same resolution.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

type Cache<T> = HashMap<String, SubscriptionHandle<T>>;

/// Resolves, creates and reconciles subscriptions, caching the results.
#[derive(Debug)]
pub(crate) struct SubscriptionResolver<C>
where
    C: Connector,
{
    config: Arc<ResolvedConfig>,
    connector: C,
    connections: Arc<ConnectionSet<C::Connection>>,
    shutdown: Arc<ShutdownSignal>,
    subscriptions: RwLock<Cache<C::Connection>>,
}

impl<C> SubscriptionResolver<C>
where
    C: Connector,
{
    pub(crate) fn new(
        config: Arc<ResolvedConfig>,
        connector: C,
        connections: Arc<ConnectionSet<C::Connection>>,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self {
            config,
            connector,
            connections,
            shutdown,
            subscriptions: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached handle for `subscription_name`, provisioning it on first use.
    pub(crate) async fn resolve(
        &self,
        subscription_name: &str,
        topic: &str,
    ) -> Result<SubscriptionHandle<C::Connection>, Error> {
        let qualified_topic = qualified_topic_name(&self.config.topic_project_id, topic);

        if let Some(handle) = self.subscriptions.read().await.get(subscription_name) {
            return Self::check_topic(handle, &qualified_topic);
        }

        let mut subscriptions = self.subscriptions.write().await;

        if let Some(handle) = subscriptions.get(subscription_name) {
            return Self::check_topic(handle, &qualified_topic);
        }

        // Close takes this lock before releasing connections.
        if self.shutdown.is_closed() {
            return Err(Error::Closed);
        }

        let connection = self.connect().await?;
        let handle = self
            .provision(connection, subscription_name, qualified_topic)
            .await?;

        subscriptions.insert(subscription_name.to_string(), handle.clone());

        Ok(handle)
    }

    /// Waits for in-flight resolutions and blocks new ones while the guard is held.
    pub(crate) async fn quiesce(&self) -> RwLockWriteGuard<'_, Cache<C::Connection>> {
        self.subscriptions.write().await
    }

    fn check_topic(
        handle: &SubscriptionHandle<C::Connection>,
        qualified_topic: &str,
    ) -> Result<SubscriptionHandle<C::Connection>, Error> {
        if handle.topic() != qualified_topic {
            return Err(Error::UnexpectedTopic {
                actual: handle.topic().to_string(),
                expected: qualified_topic.to_string(),
            });
        }

        Ok(handle.clone())
    }

    async fn connect(&self) -> Result<C::Connection, Error> {
        let connection = self
            .connector
            .connect(&self.config.project_id)
            .await
            .map_err(|e| Error::Connect {
                project_id: self.config.project_id.clone(),
                source: Box::new(e),
            })?;

        self.connections.push(connection.clone());

        Ok(connection)
    }

    async fn provision(
        &self,
        connection: C::Connection,
        subscription_name: &str,
        qualified_topic: String,
    ) -> Result<SubscriptionHandle<C::Connection>, Error> {
        let qualified_name = qualified_subscription_name(&self.config.project_id, subscription_name);

        let exists = connection
            .subscription_exists(&qualified_name)
            .await
            .map_err(|e| Error::SubscriptionExists {
                subscription: qualified_name.clone(),
                source: Box::new(e),
            })?;

        let descriptor = if exists {
            self.reconcile(&connection, &qualified_name, &qualified_topic)
                .await?
        } else if self.config.do_not_create_subscription_if_missing {
            return Err(Error::SubscriptionDoesNotExist(qualified_name));
        } else {
            self.create_subscription(&connection, &qualified_name, &qualified_topic)
                .await?
        };

        Ok(SubscriptionHandle::new(
            subscription_name.to_string(),
            qualified_name,
            qualified_topic,
            descriptor,
            self.config.receive_settings,
            connection,
        ))
    }

    async fn reconcile(
        &self,
        connection: &C::Connection,
        subscription: &str,
        topic: &str,
    ) -> Result<SubscriptionConfig, Error> {
        let actual = Self::fetch_config(connection, subscription).await?;

        if actual.topic != topic {
            return Err(Error::UnexpectedTopic {
                actual: actual.topic,
                expected: topic.to_string(),
            });
        }

        let desired = &self.config.subscription_config;

        if self.config.recreate_subscription_if_filter_changed && desired.filter_differs(&actual) {
            debug!(
                subscription,
                old_filter = %actual.filter,
                new_filter = %desired.filter,
                "Filter changed"
            );

            connection
                .delete_subscription(subscription)
                .await
                .map_err(|e| Error::DeleteSubscription {
                    subscription: subscription.to_string(),
                    source: Box::new(e),
                })?;

            debug!(subscription, "Deleted subscription");

            return self.create_subscription(connection, subscription, topic).await;
        }

        if self.config.do_not_update_subscription_if_endpoint_changed
            || !desired.push_endpoint_differs(&actual)
        {
            return Ok(actual);
        }

        let update = SubscriptionConfigToUpdate {
            push_config: Some(desired.push_config.clone()),
            ..Default::default()
        };

        let updated = connection
            .update_subscription(subscription, &update)
            .await
            .map_err(|e| Error::UpdateSubscription {
                subscription: subscription.to_string(),
                source: Box::new(e),
            })?;

        info!(
            subscription,
            topic,
            old_endpoint = %actual.push_config.endpoint,
            new_endpoint = %updated.push_config.endpoint,
            "Updated subscription endpoint"
        );
        debug!(old_config = ?actual, new_config = ?updated, "Updated subscription config");

        Ok(updated)
    }

    async fn create_subscription(
        &self,
        connection: &C::Connection,
        subscription: &str,
        topic: &str,
    ) -> Result<SubscriptionConfig, Error> {
        let topic_exists = connection
            .topic_exists(topic)
            .await
            .map_err(|e| Error::TopicExists {
                topic: topic.to_string(),
                source: Box::new(e),
            })?;

        if !topic_exists {
            if self.config.do_not_create_topic_if_missing {
                return Err(Error::TopicDoesNotExist(topic.to_string()));
            }

            match connection.create_topic(topic).await {
                Ok(()) => debug!(topic, "Created topic"),
                Err(e) if e.is_already_exists() => debug!(topic, "Topic already exists"),
                Err(e) => {
                    return Err(Error::CreateTopic {
                        topic: topic.to_string(),
                        source: Box::new(e),
                    });
                }
            }
        }

        let config = SubscriptionConfig {
            topic: topic.to_string(),
            ..self.config.subscription_config.clone()
        };

        match connection.create_subscription(subscription, &config).await {
            Ok(created) => {
                debug!(subscription, topic, "Created subscription");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(subscription, "Subscription already exists");

                let existing = Self::fetch_config(connection, subscription).await?;
                if existing.topic != topic {
                    return Err(Error::UnexpectedTopic {
                        actual: existing.topic,
                        expected: topic.to_string(),
                    });
                }

                Ok(existing)
            }
            Err(e) => Err(Error::CreateSubscription {
                subscription: subscription.to_string(),
                source: Box::new(e),
            }),
        }
    }

    async fn fetch_config(
        connection: &C::Connection,
        subscription: &str,
    ) -> Result<SubscriptionConfig, Error> {
        connection
            .subscription_config(subscription)
            .await
            .map_err(|e| Error::FetchConfig {
                subscription: subscription.to_string(),
                source: Box::new(e),
            })
    }
}

impl<T> PartialEq for SubscriptionHandle<T>
where
    T: Connection,
{
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl<T> Eq for SubscriptionHandle<T> where T: Connection {}
