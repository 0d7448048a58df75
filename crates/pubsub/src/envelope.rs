use std::collections::HashMap;
use std::time::SystemTime;

use bytes::Bytes;

/// A message as delivered by the service, with the metadata needed to settle it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Delivery-scoped id used to ack or nack this delivery.
    pub ack_id: String,

    /// Service-assigned message id, stable across redeliveries.
    pub message_id: String,

    /// Message payload.
    pub data: Bytes,

    /// Message attributes.
    pub attributes: HashMap<String, String>,

    /// Ordering key, empty when the message is unordered.
    pub ordering_key: String,

    /// When the service accepted the message.
    pub publish_time: SystemTime,

    /// How many times this message has been delivered, if the service tracks it.
    pub delivery_attempt: Option<u32>,
}

/// A message ready to be handed to the service for publishing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    /// Message payload.
    pub data: Bytes,

    /// Message attributes.
    pub attributes: HashMap<String, String>,

    /// Ordering key, empty when the message is unordered.
    pub ordering_key: String,
}
