//! Subscriber side of a durable publish/subscribe service.
//!
//! Resolves topics into named subscriptions (creating or reconciling them as
//! configured), streams their messages to the application one at a time, and
//! settles each message upstream once the application acks or nacks it.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Conversion between application messages and service envelopes.
pub mod codec;

/// Subscriber settings and subscription naming.
pub mod config;

/// Abstract connections to the service.
pub mod connection;

mod delivery;

/// Subscription descriptors and receive tuning.
pub mod descriptor;

/// Messages as delivered by the service.
pub mod envelope;

mod error;

/// Messages as seen by the application.
pub mod message;

/// Subscription resolution and caching.
pub mod resolver;

mod retry;
mod shutdown;
mod subscriber;

pub use codec::{
    CodecError, DefaultMarshalerUnmarshaler, Marshaler, OrderingMarshaler, OrderingUnmarshaler,
    Unmarshaler,
};
pub use config::{
    BackoffConfig, DEFAULT_INITIALIZE_TIMEOUT, SubscriberConfig, SubscriptionNameFn,
    topic_subscription_name, topic_subscription_name_with_suffix,
};
pub use connection::{Connection, ConnectionError, Connector, EnvelopeStream};
pub use descriptor::{
    DeadLetterPolicy, PushConfig, ReceiveSettings, RetryPolicy, SubscriptionConfig,
    SubscriptionConfigToUpdate, qualified_subscription_name, qualified_topic_name,
};
pub use envelope::{Envelope, OutgoingMessage};
pub use error::{BoxError, Error};
pub use message::{Message, Outcome};
pub use resolver::SubscriptionHandle;
pub use subscriber::{MessageStream, Subscriber};
