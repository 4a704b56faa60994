//! Message publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **message bus pattern** - a topic-based pub/sub mechanism
//! for moving [`Message`]s from producers to the router's handlers.
//!
//! ## Design Philosophy
//!
//! The bus is intentionally **lightweight** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: Works with in-memory channels, Redis Streams, brokers, etc.
//! - **At-least-once delivery**: Messages may be delivered multiple times; consumers must be idempotent
//! - **Explicit acknowledgement**: Every [`Delivery`] is either acked (done) or nacked (redeliver)
//! - **No persistence assumptions**: The bus is for distribution; the event store is the source of truth
//!
//! ## Why At-Least-Once?
//!
//! - **Store first**: Events are persisted before they are published
//! - **Idempotent consumers**: Handlers tolerate duplicates
//! - **Bus-owned redelivery**: A nacked (or never acknowledged) message comes back; the
//!   application never re-publishes on its own
//!
//! ## Thread Safety
//!
//! Publishers and subscribers are `Send + Sync`: a single handle is shared between the
//! producer task and the router's consumer tasks without external locking.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::Message;

/// Bus operation error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),

    #[error("publish to topic '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("subscribe to topic '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("acknowledgement failed: {0}")]
    Acknowledge(String),

    #[error("bus is closed")]
    Closed,
}

/// Publishing side of the bus.
///
/// `publish()` returns once the transport has accepted the message. Failures are
/// surfaced to the caller, which owns the policy (the producer treats them as fatal,
/// the router nacks the triggering input).
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError>;
}

/// Subscribing side of the bus.
///
/// Each call creates an independent [`Subscription`]. Messages are delivered in
/// the order the transport provides them; nothing here reorders or buffers
/// beyond that.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError>;
}

#[async_trait]
impl<P> Publisher for Arc<P>
where
    P: Publisher + ?Sized,
{
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        (**self).publish(topic, message).await
    }
}

#[async_trait]
impl<S> Subscriber for Arc<S>
where
    S: Subscriber + ?Sized,
{
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        (**self).subscribe(topic).await
    }
}

/// Transport callback used to settle a delivered message.
///
/// - `ack`: processing succeeded, the transport may forget the message
/// - `nack`: processing failed, the transport should make it eligible for redelivery
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, message: &Message) -> Result<(), BusError>;

    async fn nack(&self, message: &Message) -> Result<(), BusError>;
}

/// One delivery of a message to one subscription.
///
/// Settling consumes the delivery, so a message is acked or nacked at most once
/// per delivery.
pub struct Delivery {
    message: Message,
    attempt: u32,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(message: Message, acker: Arc<dyn Acknowledger>) -> Self {
        Self {
            message,
            attempt: 1,
            acker,
        }
    }

    /// Mark this delivery as the `attempt`-th (1-based) delivery of the message.
    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt.max(1);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn is_redelivery(&self) -> bool {
        self.attempt > 1
    }

    pub async fn ack(self) -> Result<(), BusError> {
        self.acker.ack(&self.message).await
    }

    pub async fn nack(self) -> Result<(), BusError> {
        self.acker.nack(&self.message).await
    }
}

impl core::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Delivery")
            .field("message", &self.message)
            .field("attempt", &self.attempt)
            .finish_non_exhaustive()
    }
}

/// A subscription to one topic.
///
/// ## Usage Pattern
///
/// ```ignore
/// let mut subscription = subscriber.subscribe("events").await?;
///
/// while let Some(delivery) = subscription.recv().await {
///     match process(delivery.message()) {
///         Ok(()) => delivery.ack().await?,
///         Err(_) => delivery.nack().await?,
///     }
/// }
/// // None: the transport closed the subscription
/// ```
///
/// A subscription is consumed by a single task; the router gives each binding its
/// own subscription.
pub struct Subscription {
    topic: String,
    deliveries: BoxStream<'static, Delivery>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, deliveries: BoxStream<'static, Delivery>) -> Self {
        Self {
            topic: topic.into(),
            deliveries,
        }
    }

    /// Build a subscription fed by a bounded channel.
    pub fn from_receiver(topic: impl Into<String>, receiver: mpsc::Receiver<Delivery>) -> Self {
        let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|d| (d, rx))
        });
        Self::new(topic, stream.boxed())
    }

    /// Build a subscription fed by an unbounded channel.
    pub fn from_unbounded(
        topic: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<Delivery>,
    ) -> Self {
        let stream = futures_util::stream::unfold(receiver, |mut rx| async move {
            rx.recv().await.map(|d| (d, rx))
        });
        Self::new(topic, stream.boxed())
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next delivery. `None` once the transport closed the subscription.
    pub async fn recv(&mut self) -> Option<Delivery> {
        self.deliveries.next().await
    }

    /// Wait up to `timeout` for the next delivery.
    ///
    /// `Err(Elapsed)` on timeout, `Ok(None)` when the subscription is closed.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Delivery>, tokio::time::error::Elapsed> {
        tokio::time::timeout(timeout, self.recv()).await
    }
}

impl core::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}
