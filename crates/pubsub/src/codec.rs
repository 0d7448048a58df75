//! Conversion between service envelopes and [`Message`]s.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use thiserror::Error;

use crate::envelope::{Envelope, OutgoingMessage};
use crate::error::BoxError;
use crate::message::Message;

/// Attribute carrying the message uuid.
pub const UUID_HEADER_KEY: &str = "_proven_message_uuid";

/// Metadata key exposing the service-assigned message id.
pub const MESSAGE_ID_HEADER_KEY: &str = "_proven_message_id";

/// Metadata key exposing the ordering key of an ordered message.
pub const ORDERING_KEY_HEADER_KEY: &str = "_proven_ordering_key";

/// Errors raised while converting messages.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Metadata uses a key reserved by the codec.
    #[error("metadata key {0} is reserved for the message uuid")]
    ReservedMetadataKey(String),

    /// The ordering key function failed.
    #[error("failed to generate ordering key: {0}")]
    OrderingKey(#[source] BoxError),

    /// The ordering key callback rejected an incoming message.
    #[error("ordering key {key} rejected: {source}")]
    OrderingRejected {
        /// The ordering key of the rejected message.
        key: String,

        /// Why it was rejected.
        #[source]
        source: BoxError,
    },

    /// The envelope could not be decoded.
    #[error("malformed envelope {message_id}: {reason}")]
    Malformed {
        /// Service-assigned id of the envelope.
        message_id: String,

        /// What was wrong with it.
        reason: String,
    },
}

/// Converts [`Message`]s into service-native outgoing messages.
pub trait Marshaler: Debug + Send + Sync + 'static {
    /// Marshals a message destined for `topic`.
    ///
    /// # Errors
    ///
    /// Returns an error if the message cannot be represented.
    fn marshal(&self, topic: &str, message: &Message) -> Result<OutgoingMessage, CodecError>;
}

/// Converts service envelopes into [`Message`]s.
pub trait Unmarshaler: Debug + Send + Sync + 'static {
    /// Unmarshals a delivered envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope cannot be processed. The envelope is
    /// then rejected without reaching the application.
    fn unmarshal(&self, envelope: &Envelope) -> Result<Message, CodecError>;
}

/// Default codec: payload as-is, metadata as attributes, uuid in a reserved attribute.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultMarshalerUnmarshaler;

impl Marshaler for DefaultMarshalerUnmarshaler {
    fn marshal(&self, _topic: &str, message: &Message) -> Result<OutgoingMessage, CodecError> {
        if message.metadata.contains_key(UUID_HEADER_KEY) {
            return Err(CodecError::ReservedMetadataKey(UUID_HEADER_KEY.to_string()));
        }

        let mut attributes = message.metadata.clone();
        attributes.insert(UUID_HEADER_KEY.to_string(), message.uuid.clone());

        Ok(OutgoingMessage {
            data: message.payload.clone(),
            attributes,
            ordering_key: String::new(),
        })
    }
}

impl Unmarshaler for DefaultMarshalerUnmarshaler {
    fn unmarshal(&self, envelope: &Envelope) -> Result<Message, CodecError> {
        let mut uuid = String::new();
        let mut metadata = std::collections::HashMap::with_capacity(envelope.attributes.len() + 2);

        for (key, value) in &envelope.attributes {
            if key == UUID_HEADER_KEY {
                uuid.clone_from(value);
            } else {
                metadata.insert(key.clone(), value.clone());
            }
        }

        metadata.insert(
            MESSAGE_ID_HEADER_KEY.to_string(),
            envelope.message_id.clone(),
        );

        if !envelope.ordering_key.is_empty() {
            metadata.insert(
                ORDERING_KEY_HEADER_KEY.to_string(),
                envelope.ordering_key.clone(),
            );
        }

        let mut message = Message::new(uuid, envelope.data.clone());
        message.metadata = metadata;

        Ok(message)
    }
}

/// Derives the ordering key of an outgoing message from its topic and contents.
pub type OrderingKeyFn = Arc<dyn Fn(&str, &Message) -> Result<String, BoxError> + Send + Sync>;

/// Receives the ordering key of each incoming message; an error rejects the message.
pub type OrderingKeyCallback = Arc<dyn Fn(&str, &Message) -> Result<(), BoxError> + Send + Sync>;

/// Default marshaling plus a generated ordering key.
#[derive(Clone)]
pub struct OrderingMarshaler {
    ordering_key: OrderingKeyFn,
}

impl OrderingMarshaler {
    /// Creates a marshaler generating ordering keys with `ordering_key`.
    pub fn new<F>(ordering_key: F) -> Self
    where
        F: Fn(&str, &Message) -> Result<String, BoxError> + Send + Sync + 'static,
    {
        Self {
            ordering_key: Arc::new(ordering_key),
        }
    }
}

impl Debug for OrderingMarshaler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingMarshaler").finish_non_exhaustive()
    }
}

impl Marshaler for OrderingMarshaler {
    fn marshal(&self, topic: &str, message: &Message) -> Result<OutgoingMessage, CodecError> {
        let mut outgoing = DefaultMarshalerUnmarshaler.marshal(topic, message)?;

        outgoing.ordering_key =
            (self.ordering_key)(topic, message).map_err(CodecError::OrderingKey)?;

        Ok(outgoing)
    }
}

/// Default unmarshaling plus an ordering key callback.
#[derive(Clone)]
pub struct OrderingUnmarshaler {
    on_ordering_key: OrderingKeyCallback,
}

impl OrderingUnmarshaler {
    /// Creates an unmarshaler passing each ordering key to `on_ordering_key`.
    pub fn new<F>(on_ordering_key: F) -> Self
    where
        F: Fn(&str, &Message) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        Self {
            on_ordering_key: Arc::new(on_ordering_key),
        }
    }
}

impl Debug for OrderingUnmarshaler {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderingUnmarshaler").finish_non_exhaustive()
    }
}

impl Unmarshaler for OrderingUnmarshaler {
    fn unmarshal(&self, envelope: &Envelope) -> Result<Message, CodecError> {
        let message = DefaultMarshalerUnmarshaler.unmarshal(envelope)?;

        (self.on_ordering_key)(&envelope.ordering_key, &message).map_err(|source| {
            CodecError::OrderingRejected {
                key: envelope.ordering_key.clone(),
                source,
            }
        })?;

        Ok(message)
    }
}
