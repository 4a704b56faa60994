//! In-memory message bus for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use eventrelay_core::MessageId;

use crate::bus::{Acknowledger, BusError, Delivery, Publisher, Subscriber, Subscription};
use crate::Message;

/// Default number of redeliveries after a nack before a message is dropped.
const DEFAULT_MAX_REDELIVERIES: u32 = 5;

/// Default number of entries kept per topic in each history.
const DEFAULT_HISTORY_LIMIT: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct InMemoryBusConfig {
    /// How many times a nacked message is redelivered before it is dropped.
    pub max_redeliveries: u32,
    /// Per-topic cap on the published/acked/nacked histories; the oldest entries go first.
    pub history_limit: usize,
}

impl Default for InMemoryBusConfig {
    fn default() -> Self {
        Self {
            max_redeliveries: DEFAULT_MAX_REDELIVERIES,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// In-memory pub/sub bus.
///
/// - No IO
/// - Fan-out: every subscription of a topic gets its own copy
/// - Nack redelivers the same message (same uuid, same payload) to the same
///   subscription, up to `max_redeliveries` times
/// - Keeps a bounded per-topic history of published, acked and nacked messages for inspection
#[derive(Debug, Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<Inner>,
}

type History<T> = HashMap<String, VecDeque<T>>;

#[derive(Debug, Default)]
struct Inner {
    config: InMemoryBusConfig,
    closed: Mutex<bool>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Delivery>>>>,
    published: Mutex<History<Message>>,
    acked: Mutex<History<MessageId>>,
    nacked: Mutex<History<MessageId>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: InMemoryBusConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                ..Inner::default()
            }),
        }
    }

    /// Messages accepted for `topic`, in publish order (the most recent `history_limit`).
    pub fn published(&self, topic: &str) -> Vec<Message> {
        snapshot(&self.inner.published, topic)
    }

    /// Uuids of deliveries acked on `topic`, in settle order.
    pub fn acked(&self, topic: &str) -> Vec<MessageId> {
        snapshot(&self.inner.acked, topic)
    }

    /// Uuids of deliveries nacked on `topic`, in settle order.
    pub fn nacked(&self, topic: &str) -> Vec<MessageId> {
        snapshot(&self.inner.nacked, topic)
    }

    /// Close the bus: end all subscriptions and reject further publishes.
    pub fn close(&self) {
        if let Ok(mut closed) = self.inner.closed.lock() {
            *closed = true;
        }
        if let Ok(mut subs) = self.inner.subscribers.lock() {
            subs.clear();
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.lock().map(|c| *c).unwrap_or(true)
    }
}

fn snapshot<T: Clone>(map: &Mutex<History<T>>, topic: &str) -> Vec<T> {
    map.lock()
        .map(|m| m.get(topic).map(|h| h.iter().cloned().collect()).unwrap_or_default())
        .unwrap_or_default()
}

fn record<T>(map: &Mutex<History<T>>, limit: usize, topic: &str, value: T) {
    if limit == 0 {
        return;
    }
    if let Ok(mut m) = map.lock() {
        let history = m.entry(topic.to_string()).or_default();
        if history.len() >= limit {
            history.pop_front();
        }
        history.push_back(value);
    }
}

#[async_trait]
impl Publisher for InMemoryBus {
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let mut subs = self.inner.subscribers.lock().map_err(|_| BusError::Publish {
            topic: topic.to_string(),
            reason: "lock poisoned".to_string(),
        })?;

        record(&self.inner.published, self.inner.config.history_limit, topic, message.clone());

        if let Some(senders) = subs.get_mut(topic) {
            // Drop any dead subscribers while publishing.
            senders.retain(|tx| {
                let acker = InMemoryAcker {
                    bus: self.inner.clone(),
                    topic: topic.to_string(),
                    sender: tx.clone(),
                    attempt: 1,
                };
                tx.send(Delivery::new(message.clone(), Arc::new(acker))).is_ok()
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Subscriber for InMemoryBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .map_err(|_| BusError::Subscribe {
                topic: topic.to_string(),
                reason: "lock poisoned".to_string(),
            })?
            .entry(topic.to_string())
            .or_default()
            .push(tx);

        Ok(Subscription::from_unbounded(topic, rx))
    }
}

struct InMemoryAcker {
    bus: Arc<Inner>,
    topic: String,
    sender: mpsc::UnboundedSender<Delivery>,
    attempt: u32,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, message: &Message) -> Result<(), BusError> {
        record(&self.bus.acked, self.bus.config.history_limit, &self.topic, message.uuid());
        Ok(())
    }

    async fn nack(&self, message: &Message) -> Result<(), BusError> {
        record(&self.bus.nacked, self.bus.config.history_limit, &self.topic, message.uuid());

        let redeliveries = self.attempt - 1;
        if redeliveries >= self.bus.config.max_redeliveries {
            error!(
                topic = %self.topic,
                message_uuid = %message.uuid(),
                attempts = self.attempt,
                "message exceeded redelivery limit; dropping"
            );
            return Ok(());
        }

        let next = InMemoryAcker {
            bus: self.bus.clone(),
            topic: self.topic.clone(),
            sender: self.sender.clone(),
            attempt: self.attempt + 1,
        };
        debug!(topic = %self.topic, message_uuid = %message.uuid(), attempt = next.attempt, "redelivering nacked message");
        let attempt = next.attempt;

        if self
            .sender
            .send(Delivery::new(message.clone(), Arc::new(next)).with_attempt(attempt))
            .is_err()
        {
            debug!(
                topic = %self.topic,
                message_uuid = %message.uuid(),
                attempt,
                "redelivery skipped; subscription is gone"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::capture_logs;
    use std::time::Duration;

    fn msg(body: &str) -> Message {
        Message::new(MessageId::new(), body.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn fans_out_to_every_subscription_of_a_topic() {
        let bus = InMemoryBus::new();
        let mut a = bus.subscribe("events").await.unwrap();
        let mut b = bus.subscribe("events").await.unwrap();
        let mut other = bus.subscribe("other").await.unwrap();

        let m = msg("hello");
        bus.publish("events", m.clone()).await.unwrap();

        assert_eq!(a.recv().await.unwrap().message(), &m);
        assert_eq!(b.recv().await.unwrap().message(), &m);
        assert!(other.recv_timeout(Duration::from_millis(20)).await.is_err());
        assert_eq!(bus.published("events"), vec![m]);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_recorded_but_not_delivered() {
        let bus = InMemoryBus::new();
        bus.publish("events", msg("lost")).await.unwrap();

        let mut late = bus.subscribe("events").await.unwrap();
        assert!(late.recv_timeout(Duration::from_millis(20)).await.is_err());
        assert_eq!(bus.published("events").len(), 1);
    }

    #[tokio::test]
    async fn nack_redelivers_the_same_message() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("events").await.unwrap();
        let m = msg("retry me");
        bus.publish("events", m.clone()).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!(first.attempt(), 1);
        first.nack().await.unwrap();

        let second = sub.recv().await.unwrap();
        assert!(second.is_redelivery());
        assert_eq!(second.attempt(), 2);
        assert_eq!(second.message(), &m);
        second.ack().await.unwrap();

        assert_eq!(bus.nacked("events"), vec![m.uuid()]);
        assert_eq!(bus.acked("events"), vec![m.uuid()]);
    }

    #[tokio::test]
    async fn redelivery_stops_at_the_configured_limit() {
        let bus = InMemoryBus::with_config(InMemoryBusConfig {
            max_redeliveries: 2,
            ..InMemoryBusConfig::default()
        });
        let mut sub = bus.subscribe("events").await.unwrap();
        bus.publish("events", msg("poison")).await.unwrap();

        let mut deliveries = 0;
        while let Ok(Some(delivery)) = sub.recv_timeout(Duration::from_millis(50)).await {
            deliveries += 1;
            delivery.nack().await.unwrap();
        }

        assert_eq!(deliveries, 3);
        assert_eq!(bus.nacked("events").len(), 3);
    }

    #[tokio::test]
    async fn history_keeps_only_the_most_recent_entries() {
        let bus = InMemoryBus::with_config(InMemoryBusConfig {
            history_limit: 3,
            ..InMemoryBusConfig::default()
        });
        let mut sub = bus.subscribe("events").await.unwrap();

        let messages: Vec<Message> = (0..5).map(|i| msg(&format!("m{i}"))).collect();
        for m in &messages {
            bus.publish("events", m.clone()).await.unwrap();
            sub.recv().await.unwrap().ack().await.unwrap();
        }

        assert_eq!(bus.published("events"), messages[2..].to_vec());
        let newest: Vec<MessageId> = messages[2..].iter().map(Message::uuid).collect();
        assert_eq!(bus.acked("events"), newest);
    }

    #[tokio::test]
    async fn zero_history_limit_records_nothing_but_still_delivers() {
        let bus = InMemoryBus::with_config(InMemoryBusConfig {
            history_limit: 0,
            ..InMemoryBusConfig::default()
        });
        let mut sub = bus.subscribe("events").await.unwrap();
        let m = msg("hello");
        bus.publish("events", m.clone()).await.unwrap();

        assert_eq!(sub.recv().await.unwrap().message(), &m);
        assert!(bus.published("events").is_empty());
    }

    #[tokio::test]
    async fn nack_after_the_subscription_is_dropped_is_logged_not_failed() {
        let (logs, _guard) = capture_logs();
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("events").await.unwrap();
        let m = msg("orphan");
        bus.publish("events", m.clone()).await.unwrap();

        let delivery = sub.recv().await.unwrap();
        drop(sub);

        delivery.nack().await.unwrap();
        assert_eq!(bus.nacked("events"), vec![m.uuid()]);
        assert!(logs.contents().contains("redelivery skipped; subscription is gone"));
    }

    #[tokio::test]
    async fn close_ends_subscriptions_and_rejects_publishes() {
        let bus = InMemoryBus::new();
        let mut sub = bus.subscribe("events").await.unwrap();
        bus.close();

        assert!(sub.recv().await.is_none());
        assert!(matches!(
            bus.publish("events", msg("late")).await,
            Err(BusError::Closed)
        ));
        assert!(matches!(bus.subscribe("events").await, Err(BusError::Closed)));
    }
}
