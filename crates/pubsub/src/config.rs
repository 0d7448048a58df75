use std::fmt::{Debug, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::codec::{DefaultMarshalerUnmarshaler, Unmarshaler};
use crate::descriptor::{ReceiveSettings, SubscriptionConfig};
use crate::error::Error;

/// Default time allowed for [`Subscriber::initialize`](crate::Subscriber::initialize).
pub const DEFAULT_INITIALIZE_TIMEOUT: Duration = Duration::from_secs(10);

/// Derives a subscription name from a topic name.
///
/// Must be deterministic: the same topic has to map to the same subscription
/// across restarts for the subscription to be durable.
pub type SubscriptionNameFn = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Uses the topic name as the subscription name.
#[must_use]
pub fn topic_subscription_name() -> SubscriptionNameFn {
    Arc::new(|topic: &str| topic.to_string())
}

/// Uses the topic name followed by `suffix` as the subscription name.
#[must_use]
pub fn topic_subscription_name_with_suffix<S>(suffix: S) -> SubscriptionNameFn
where
    S: Into<String>,
{
    let suffix = suffix.into();
    Arc::new(move |topic: &str| format!("{topic}{suffix}"))
}

/// Exponential backoff between attempts of a failed streaming receive.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial_interval: Duration,

    /// Upper bound for a single delay.
    pub max_interval: Duration,

    /// Growth factor applied after each attempt. Must be finite and at least 1.
    pub multiplier: f64,

    /// Relative jitter applied to each delay, in `[0, 1]`.
    pub randomization_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(60),
            multiplier: 1.5,
            randomization_factor: 0.5,
        }
    }
}

/// Configuration for the [`Subscriber`](crate::Subscriber).
#[derive(Clone, Default)]
pub struct SubscriberConfig {
    /// Generates the subscription name for a topic. Defaults to
    /// [`topic_subscription_name`].
    ///
    /// A topic can have many subscriptions, but a subscription belongs to a single topic.
    pub generate_subscription_name: Option<SubscriptionNameFn>,

    /// Project owning the subscriptions.
    pub project_id: String,

    /// Project owning the topics, when different from `project_id`.
    pub topic_project_id: Option<String>,

    /// Fail with [`Error::SubscriptionDoesNotExist`] instead of creating missing subscriptions.
    pub do_not_create_subscription_if_missing: bool,

    /// Fail with [`Error::TopicDoesNotExist`] instead of creating missing topics.
    pub do_not_create_topic_if_missing: bool,

    /// Leave the push endpoint of existing subscriptions alone.
    pub do_not_update_subscription_if_endpoint_changed: bool,

    /// Delete and recreate existing subscriptions whose filter differs.
    pub recreate_subscription_if_filter_changed: bool,

    /// Time allowed for [`Subscriber::initialize`](crate::Subscriber::initialize).
    /// Defaults to 10 seconds if not set.
    pub initialize_timeout: Option<Duration>,

    /// Client-local receive tuning.
    pub receive_settings: ReceiveSettings,

    /// Desired subscription shape.
    pub subscription_config: SubscriptionConfig,

    /// Converts envelopes into messages. Defaults to [`DefaultMarshalerUnmarshaler`].
    pub unmarshaler: Option<Arc<dyn Unmarshaler>>,

    /// Backoff between receive attempts.
    pub backoff: BackoffConfig,
}

impl Debug for SubscriberConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberConfig")
            .field("project_id", &self.project_id)
            .field("topic_project_id", &self.topic_project_id)
            .field(
                "do_not_create_subscription_if_missing",
                &self.do_not_create_subscription_if_missing,
            )
            .field(
                "do_not_create_topic_if_missing",
                &self.do_not_create_topic_if_missing,
            )
            .field(
                "do_not_update_subscription_if_endpoint_changed",
                &self.do_not_update_subscription_if_endpoint_changed,
            )
            .field(
                "recreate_subscription_if_filter_changed",
                &self.recreate_subscription_if_filter_changed,
            )
            .field("initialize_timeout", &self.initialize_timeout)
            .field("receive_settings", &self.receive_settings)
            .field("subscription_config", &self.subscription_config)
            .field("unmarshaler", &self.unmarshaler)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

/// [`SubscriberConfig`] with defaults applied and validated.
#[derive(Debug)]
pub(crate) struct ResolvedConfig {
    pub generate_subscription_name: NameFn,
    pub project_id: String,
    pub topic_project_id: String,
    pub do_not_create_subscription_if_missing: bool,
    pub do_not_create_topic_if_missing: bool,
    pub do_not_update_subscription_if_endpoint_changed: bool,
    pub recreate_subscription_if_filter_changed: bool,
    pub initialize_timeout: Duration,
    pub receive_settings: ReceiveSettings,
    pub subscription_config: SubscriptionConfig,
    pub unmarshaler: Arc<dyn Unmarshaler>,
    pub backoff: BackoffConfig,
}

pub(crate) struct NameFn(SubscriptionNameFn);

impl NameFn {
    pub(crate) fn generate(&self, topic: &str) -> String {
        (self.0)(topic)
    }
}

impl Debug for NameFn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("NameFn")
    }
}

impl TryFrom<SubscriberConfig> for ResolvedConfig {
    type Error = Error;

    fn try_from(
        SubscriberConfig {
            generate_subscription_name,
            project_id,
            topic_project_id,
            do_not_create_subscription_if_missing,
            do_not_create_topic_if_missing,
            do_not_update_subscription_if_endpoint_changed,
            recreate_subscription_if_filter_changed,
            initialize_timeout,
            receive_settings,
            subscription_config,
            unmarshaler,
            backoff,
        }: SubscriberConfig,
    ) -> Result<Self, Error> {
        if project_id.trim().is_empty() {
            return Err(Error::Config("project id must not be empty".to_string()));
        }

        let topic_project_id = match topic_project_id {
            Some(topic_project_id) if topic_project_id.trim().is_empty() => {
                return Err(Error::Config(
                    "topic project id must not be empty when set".to_string(),
                ));
            }
            Some(topic_project_id) => topic_project_id,
            None => project_id.clone(),
        };

        let initialize_timeout = initialize_timeout.unwrap_or(DEFAULT_INITIALIZE_TIMEOUT);
        if initialize_timeout.is_zero() {
            return Err(Error::Config(
                "initialize timeout must be greater than zero".to_string(),
            ));
        }

        if backoff.initial_interval.is_zero() {
            return Err(Error::Config(
                "backoff initial interval must be greater than zero".to_string(),
            ));
        }
        if backoff.max_interval < backoff.initial_interval {
            return Err(Error::Config(
                "backoff max interval must not be below the initial interval".to_string(),
            ));
        }
        if !backoff.multiplier.is_finite() || backoff.multiplier < 1.0 {
            return Err(Error::Config(
                "backoff multiplier must be finite and at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&backoff.randomization_factor) {
            return Err(Error::Config(
                "backoff randomization factor must be within [0, 1]".to_string(),
            ));
        }

        Ok(Self {
            generate_subscription_name: NameFn(
                generate_subscription_name.unwrap_or_else(topic_subscription_name),
            ),
            project_id,
            topic_project_id,
            do_not_create_subscription_if_missing,
            do_not_create_topic_if_missing,
            do_not_update_subscription_if_endpoint_changed,
            recreate_subscription_if_filter_changed,
            initialize_timeout,
            receive_settings,
            subscription_config,
            unmarshaler: unmarshaler
                .unwrap_or_else(|| Arc::new(DefaultMarshalerUnmarshaler) as Arc<dyn Unmarshaler>),
            backoff,
        })
    }
}
