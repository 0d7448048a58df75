use std::time::Duration;

use thiserror::Error;

/// Boxed transport error kept as the source of a higher-level error.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors raised by the subscriber.
#[derive(Debug, Error)]
pub enum Error {
    /// The subscriber is closed or closing.
    #[error("subscriber is closed")]
    Closed,

    /// Caller-supplied settings are invalid.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The subscription is missing and creating it is disabled.
    #[error("subscription does not exist: {0}")]
    SubscriptionDoesNotExist(String),

    /// The topic is missing and creating it is disabled.
    #[error("topic does not exist: {0}")]
    TopicDoesNotExist(String),

    /// The subscription exists but is bound to a different topic.
    #[error(
        "requested subscription already exists, but for other topic than expected \
         (topic of existing subscription: {actual}; expecting: {expected})"
    )]
    UnexpectedTopic {
        /// Topic the existing subscription is bound to.
        actual: String,

        /// Topic the caller asked for.
        expected: String,
    },

    /// Opening a connection to the service failed.
    #[error("could not connect to project {project_id}: {source}")]
    Connect {
        /// Project the connection was opened for.
        project_id: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Checking whether a subscription exists failed.
    #[error("could not check if subscription {subscription} exists: {source}")]
    SubscriptionExists {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Checking whether a topic exists failed.
    #[error("could not check if topic {topic} exists: {source}")]
    TopicExists {
        /// Topic name.
        topic: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Fetching the descriptor of an existing subscription failed.
    #[error("could not fetch config for existing subscription {subscription}: {source}")]
    FetchConfig {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Creating a topic failed.
    #[error("could not create topic {topic} for subscription: {source}")]
    CreateTopic {
        /// Topic name.
        topic: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Creating a subscription failed.
    #[error("cannot create subscription {subscription}: {source}")]
    CreateSubscription {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Deleting a subscription before recreating it failed.
    #[error("could not delete subscription {subscription}: {source}")]
    DeleteSubscription {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Updating the push endpoint of a subscription failed.
    #[error("could not update subscription {subscription}: {source}")]
    UpdateSubscription {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// The caller cancelled while the subscription was being resolved.
    #[error("resolving subscription {0} was cancelled")]
    Cancelled(String),

    /// Resolution did not finish within the initialization timeout.
    #[error("initializing subscription {subscription} timed out after {timeout:?}")]
    InitializeTimeout {
        /// Subscription name.
        subscription: String,

        /// The configured timeout.
        timeout: Duration,
    },

    /// The streaming receive failed.
    #[error("receiving from subscription {subscription} failed: {source}")]
    Receive {
        /// Subscription name.
        subscription: String,

        /// Underlying transport error.
        #[source]
        source: BoxError,
    },

    /// Releasing one or more connections failed.
    #[error("unable to close {} connection(s): {}", .0.len(), join_errors(.0))]
    Close(Vec<BoxError>),
}

fn join_errors(errors: &[BoxError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
