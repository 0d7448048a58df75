use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Decision an application made about a delivered message.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Processed; the service may forget the message.
    Acked,

    /// Not processed; the service should redeliver the message.
    Nacked,
}

struct Decision {
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    receiver: Mutex<Option<oneshot::Receiver<Outcome>>>,
    outcome: Mutex<Option<Outcome>>,
}

impl Decision {
    fn new() -> Self {
        let (sender, receiver) = oneshot::channel();

        Self {
            sender: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
            outcome: Mutex::new(None),
        }
    }

    fn decide(&self, outcome: Outcome) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };

        *self.outcome.lock() = Some(outcome);

        // The delivery side may already have given up on the message.
        let _ = sender.send(outcome);

        true
    }
}

/// Internal representation of a message handed to the application.
///
/// Clones share the same decision: whichever clone calls [`Message::ack`] or
/// [`Message::nack`] first settles the message for all of them. Dropping every
/// clone of a delivered message without deciding counts as a rejection.
#[derive(Clone)]
pub struct Message {
    /// Application-level message id.
    pub uuid: String,

    /// Application-level metadata.
    pub metadata: HashMap<String, String>,

    /// Message payload.
    pub payload: Bytes,

    context: CancellationToken,
    decision: Arc<Decision>,
}

impl Message {
    /// Creates a new undecided message.
    pub fn new<U>(uuid: U, payload: Bytes) -> Self
    where
        U: Into<String>,
    {
        Self {
            uuid: uuid.into(),
            metadata: HashMap::new(),
            payload,
            context: CancellationToken::new(),
            decision: Arc::new(Decision::new()),
        }
    }

    /// Acknowledges the message. Returns `false` if a decision was already made.
    pub fn ack(&self) -> bool {
        self.decision.decide(Outcome::Acked)
    }

    /// Rejects the message. Returns `false` if a decision was already made.
    pub fn nack(&self) -> bool {
        self.decision.decide(Outcome::Nacked)
    }

    /// The decision made so far, if any.
    #[must_use]
    pub fn outcome(&self) -> Option<Outcome> {
        *self.decision.outcome.lock()
    }

    /// Per-message context. Cancelled when the message is abandoned, when its
    /// subscription stops, or when the application cancels it.
    #[must_use]
    pub const fn context(&self) -> &CancellationToken {
        &self.context
    }

    /// Convenience accessor for a metadata value.
    #[must_use]
    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub(crate) fn set_context(&mut self, context: CancellationToken) {
        self.context = context;
    }

    pub(crate) fn take_outcome(&self) -> Option<oneshot::Receiver<Outcome>> {
        self.decision.receiver.lock().take()
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("uuid", &self.uuid)
            .field("metadata", &self.metadata)
            .field("payload", &self.payload)
            .field("outcome", &self.outcome())
            .finish_non_exhaustive()
    }
}
