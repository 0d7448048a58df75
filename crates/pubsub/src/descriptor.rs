//! Desired and actual shapes of remote subscriptions.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default cap on messages awaiting an ack/nack decision per subscription.
pub const DEFAULT_MAX_OUTSTANDING_MESSAGES: usize = 1000;

/// Default cap on payload bytes awaiting an ack/nack decision per subscription.
pub const DEFAULT_MAX_OUTSTANDING_BYTES: usize = 1_000_000_000;

/// Default number of parallel streaming pulls opened by a backend.
pub const DEFAULT_NUM_STREAMS: usize = 10;

/// Default maximum time a backend keeps extending a message's ack deadline.
pub const DEFAULT_MAX_EXTENSION: Duration = Duration::from_secs(60 * 60);

/// Builds the fully-qualified name of a topic.
#[must_use]
pub fn qualified_topic_name(project_id: &str, topic: &str) -> String {
    format!("projects/{project_id}/topics/{topic}")
}

/// Builds the fully-qualified name of a subscription.
#[must_use]
pub fn qualified_subscription_name(project_id: &str, subscription: &str) -> String {
    format!("projects/{project_id}/subscriptions/{subscription}")
}

/// Push delivery settings of a subscription. An empty endpoint means pull delivery.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct PushConfig {
    /// URL the service pushes messages to.
    pub endpoint: String,

    /// Endpoint attributes, e.g. the push payload format version.
    pub attributes: HashMap<String, String>,
}

/// Redelivery backoff applied by the service to rejected messages.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Minimum delay before a rejected message is redelivered.
    pub minimum_backoff: Duration,

    /// Maximum delay before a rejected message is redelivered.
    pub maximum_backoff: Duration,
}

/// Where undeliverable messages end up.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct DeadLetterPolicy {
    /// Fully-qualified name of the dead letter topic.
    pub dead_letter_topic: String,

    /// Delivery attempts before a message is dead-lettered.
    pub max_delivery_attempts: u32,
}

/// Configuration descriptor of a subscription.
///
/// Used both for the shape a caller wants and for the shape the service reports.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct SubscriptionConfig {
    /// Fully-qualified name of the bound topic. Ignored in the desired shape:
    /// resolution always binds the requested topic.
    pub topic: String,

    /// Push delivery settings.
    pub push_config: PushConfig,

    /// Time the service waits for an ack before redelivering.
    pub ack_deadline: Duration,

    /// Whether acknowledged messages are kept for the retention duration.
    pub retain_acked_messages: bool,

    /// How long unacknowledged (or retained) messages are kept.
    pub retention_duration: Duration,

    /// Inactivity period after which the subscription expires. `None` never expires.
    pub expiration_policy: Option<Duration>,

    /// Labels attached to the subscription.
    pub labels: HashMap<String, String>,

    /// Whether messages with the same ordering key are delivered in order.
    pub enable_message_ordering: bool,

    /// Whether the service guarantees exactly-once delivery.
    pub enable_exactly_once_delivery: bool,

    /// Filter expression selecting which messages are delivered.
    pub filter: String,

    /// Redelivery backoff for rejected messages.
    pub retry_policy: Option<RetryPolicy>,

    /// Dead letter routing.
    pub dead_letter_policy: Option<DeadLetterPolicy>,

    /// Whether the subscription is detached from its topic.
    pub detached: bool,
}

impl SubscriptionConfig {
    /// Whether the filter of `other` differs from this one, ignoring whitespace.
    #[must_use]
    pub fn filter_differs(&self, other: &Self) -> bool {
        strip_whitespace(&self.filter) != strip_whitespace(&other.filter)
    }

    /// Whether the push endpoint of `other` differs from this one.
    #[must_use]
    pub fn push_endpoint_differs(&self, other: &Self) -> bool {
        self.push_config.endpoint != other.push_config.endpoint
    }
}

fn strip_whitespace(filter: &str) -> String {
    filter.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Partial update of a subscription. `None` fields are left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionConfigToUpdate {
    /// New push delivery settings.
    pub push_config: Option<PushConfig>,

    /// New ack deadline.
    pub ack_deadline: Option<Duration>,

    /// New labels.
    pub labels: Option<HashMap<String, String>>,
}

/// Client-local receive tuning. Never compared against the remote descriptor.
///
/// Zero values fall back to the defaults.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(default)]
pub struct ReceiveSettings {
    /// Maximum time a backend keeps extending ack deadlines of held messages.
    pub max_extension: Duration,

    /// Maximum messages awaiting a decision at once.
    pub max_outstanding_messages: usize,

    /// Maximum payload bytes awaiting a decision at once.
    pub max_outstanding_bytes: usize,

    /// Number of parallel streaming pulls a backend may open.
    pub num_streams: usize,
}

impl ReceiveSettings {
    /// Effective outstanding message cap.
    #[must_use]
    pub const fn max_outstanding_messages(&self) -> usize {
        if self.max_outstanding_messages == 0 {
            DEFAULT_MAX_OUTSTANDING_MESSAGES
        } else {
            self.max_outstanding_messages
        }
    }

    /// Effective outstanding byte cap.
    #[must_use]
    pub const fn max_outstanding_bytes(&self) -> usize {
        if self.max_outstanding_bytes == 0 {
            DEFAULT_MAX_OUTSTANDING_BYTES
        } else {
            self.max_outstanding_bytes
        }
    }

    /// Effective number of streams.
    #[must_use]
    pub const fn num_streams(&self) -> usize {
        if self.num_streams == 0 {
            DEFAULT_NUM_STREAMS
        } else {
            self.num_streams
        }
    }

    /// Effective ack deadline extension limit.
    #[must_use]
    pub fn max_extension(&self) -> Duration {
        if self.max_extension.is_zero() {
            DEFAULT_MAX_EXTENSION
        } else {
            self.max_extension
        }
    }
}
