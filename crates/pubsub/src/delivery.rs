use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, Span, debug, error, info, trace, warn};

use crate::codec::Unmarshaler;
use crate::connection::Connection;
use crate::envelope::Envelope;
use crate::error::Error;
use crate::message::{Message, Outcome};
use crate::resolver::SubscriptionHandle;

/// Pulls envelopes from one subscription and hands them out one by one.
#[derive(Debug)]
pub(crate) struct DeliveryLoop<T>
where
    T: Connection,
{
    handle: SubscriptionHandle<T>,
    delivery: Delivery<T>,
}

#[derive(Clone, Debug)]
struct Delivery<T>
where
    T: Connection,
{
    connection: T,
    subscription: Arc<str>,
    unmarshaler: Arc<dyn Unmarshaler>,
    shutdown: CancellationToken,
    output: flume::Sender<Message>,
}

impl<T> DeliveryLoop<T>
where
    T: Connection,
{
    pub(crate) fn new(
        handle: SubscriptionHandle<T>,
        unmarshaler: Arc<dyn Unmarshaler>,
        shutdown: CancellationToken,
        output: flume::Sender<Message>,
    ) -> Self {
        let delivery = Delivery {
            connection: handle.connection().clone(),
            subscription: Arc::from(handle.qualified_name()),
            unmarshaler,
            shutdown,
            output,
        };

        Self { handle, delivery }
    }

    /// Runs one streaming pull until `token` is cancelled or the stream ends.
    ///
    /// Returns only once every message handed out by this run has been decided.
    pub(crate) async fn run(&self, token: &CancellationToken) -> Result<(), Error> {
        let settings = self.handle.receive_settings();

        let pulled = tokio::select! {
            biased;
            () = token.cancelled() => return Ok(()),
            pulled = self.delivery.connection.streaming_pull(&self.delivery.subscription, settings) => pulled,
        };

        let mut envelopes = pulled.map_err(|e| Error::Receive {
            subscription: self.delivery.subscription.to_string(),
            source: Box::new(e),
        })?;

        let permits = Arc::new(Semaphore::new(
            settings
                .max_outstanding_messages()
                .min(Semaphore::MAX_PERMITS),
        ));
        let tracker = TaskTracker::new();

        let result = loop {
            let permit = tokio::select! {
                biased;
                () = token.cancelled() => break Ok(()),
                permit = permits.clone().acquire_owned() => permit,
            };

            let Ok(permit) = permit else {
                break Ok(());
            };

            let next = tokio::select! {
                biased;
                () = token.cancelled() => break Ok(()),
                next = envelopes.next() => next,
            };

            match next {
                Some(Ok(envelope)) => {
                    tracker.spawn(
                        self.delivery
                            .clone()
                            .deliver(envelope, token.clone(), permit)
                            .instrument(Span::current()),
                    );
                }
                Some(Err(e)) => {
                    break Err(Error::Receive {
                        subscription: self.delivery.subscription.to_string(),
                        source: Box::new(e),
                    });
                }
                None => {
                    debug!("Streaming pull ended");
                    break Ok(());
                }
            }
        };

        tracker.close();
        tracker.wait().await;

        result
    }
}

impl<T> Delivery<T>
where
    T: Connection,
{
    async fn deliver(
        self,
        envelope: Envelope,
        subscription_token: CancellationToken,
        _permit: OwnedSemaphorePermit,
    ) {
        let mut message = match self.unmarshaler.unmarshal(&envelope) {
            Ok(message) => message,
            Err(error) => {
                error!(%error, message_id = %envelope.message_id, "Could not unmarshal message");
                self.nack(&envelope).await;
                return;
            }
        };

        let Some(outcome) = message.take_outcome() else {
            warn!(message_uuid = %message.uuid, "Unmarshaled message was already handed out");
            self.nack(&envelope).await;
            return;
        };

        let context = subscription_token.child_token();
        let _cancel_context = context.clone().drop_guard();
        message.set_context(context.clone());

        let uuid = message.uuid.clone();
        trace!(message_uuid = %uuid, "Sending message to output");

        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => {
                info!(message_uuid = %uuid, "Message not consumed, subscriber is closing");
                self.nack(&envelope).await;
                return;
            }
            () = context.cancelled() => {
                info!(message_uuid = %uuid, "Message not consumed, context cancelled");
                self.nack(&envelope).await;
                return;
            }
            sent = self.output.send_async(message) => {
                if sent.is_err() {
                    info!(message_uuid = %uuid, "Output dropped, stopping subscription");
                    subscription_token.cancel();
                    self.nack(&envelope).await;
                    return;
                }
            }
        }

        let outcome = tokio::select! {
            biased;
            decided = outcome => decided.unwrap_or_else(|_| {
                trace!(message_uuid = %uuid, "Message dropped undecided");
                Outcome::Nacked
            }),
            () = self.shutdown.cancelled() => {
                trace!(message_uuid = %uuid, "Subscriber closing, nacking message");
                Outcome::Nacked
            }
            () = context.cancelled() => {
                trace!(message_uuid = %uuid, "Context cancelled, nacking message");
                Outcome::Nacked
            }
        };

        match outcome {
            Outcome::Acked => {
                self.ack(&envelope).await;
                trace!(message_uuid = %uuid, "Message acked");
            }
            Outcome::Nacked => {
                self.nack(&envelope).await;
                trace!(message_uuid = %uuid, "Message nacked");
            }
        }
    }

    async fn ack(&self, envelope: &Envelope) {
        if let Err(error) = self.connection.ack(&self.subscription, &envelope.ack_id).await {
            warn!(%error, message_id = %envelope.message_id, "Failed to ack message");
        }
    }

    async fn nack(&self, envelope: &Envelope) {
        if let Err(error) = self.connection.nack(&self.subscription, &envelope.ack_id).await {
            warn!(%error, message_id = %envelope.message_id, "Failed to nack message");
        }
    }
}
