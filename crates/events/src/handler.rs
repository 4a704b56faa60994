use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use eventrelay_core::DomainError;

use crate::{Event, Message};

/// Error returned by a [`Handler`]. Any error makes the router nack the input.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("payload could not be decoded: {0}")]
    Decode(String),

    #[error("invalid event: {0}")]
    Invalid(#[from] DomainError),

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outbound messages on success, or the reason the input should be redelivered.
pub type HandlerResult = Result<Vec<Message>, HandlerError>;

/// Processes one inbound message (message handler abstraction).
///
/// The router invokes a handler once per delivery and then settles the delivery:
///
/// - `Ok(messages)`: every returned message is published to the binding's output
///   topic, then the input is acked. An empty vec is a valid "consumed, nothing to forward".
/// - `Err(_)`: the input is nacked and nothing is published.
///
/// ## Idempotency
///
/// Delivery is at-least-once, so the same message (same uuid, same payload) can
/// reach a handler more than once. Implementations must give the same result for
/// the same input and must not assume a message is seen exactly once.
///
/// Plain closures `Fn(&Message) -> HandlerResult` are handlers too, which keeps
/// tests and one-off bindings short.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, message: &Message) -> HandlerResult;
}

#[async_trait]
impl<F> Handler for F
where
    F: Fn(&Message) -> HandlerResult + Send + Sync,
{
    async fn handle(&self, message: &Message) -> HandlerResult {
        (self)(message)
    }
}

/// Decodes inbound events, logs them, and forwards the original message unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardEventHandler;

impl ForwardEventHandler {
    pub fn new() -> Self {
        Self
    }

    /// Parse and validate the event carried by `message`.
    pub fn decode(message: &Message) -> Result<Event, HandlerError> {
        let event =
            Event::from_wire(message.payload()).map_err(|e| HandlerError::Decode(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }
}

#[async_trait]
impl Handler for ForwardEventHandler {
    async fn handle(&self, message: &Message) -> HandlerResult {
        let event = Self::decode(message)?;

        info!(
            event_id = %event.id(),
            event_type = event.event_type(),
            payload = event.payload(),
            timestamp = %event.timestamp().to_rfc3339(),
            message_uuid = %message.uuid(),
            "received event"
        );

        Ok(vec![message.clone()])
    }
}
