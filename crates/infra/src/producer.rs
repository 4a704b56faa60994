//! Periodic event producer.
//!
//! Each tick:
//! 1. builds a new [`Event`] (fresh id, configured type and payload, current time)
//! 2. persists it through the [`EventStore`]
//! 3. wraps its wire form in a new [`Message`] and publishes it
//! 4. sleeps for the configured interval
//!
//! ## Failure policy
//!
//! - Store failure: logged with the event id, the event is dropped (never
//!   retried, never published) and the loop carries on.
//! - Publish failure: fatal. `run()` returns [`ProducerError::Publish`] and the
//!   process is expected to shut down.
//!
//! Publishing only after a successful put means every event on the bus can be
//! found in the store.

use std::time::Duration;

use chrono::{SubsecRound, Utc};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use eventrelay_core::{EventId, MessageId};
use eventrelay_events::{BusError, Event, Message, Publisher};

use crate::event_store::EventStore;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub topic: String,
    pub event_type: String,
    pub payload: String,
    pub interval: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            topic: "events".to_string(),
            event_type: "example_event".to_string(),
            payload: "Hello, World!".to_string(),
            interval: DEFAULT_INTERVAL,
        }
    }
}

/// What happened to the event built in one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Published {
        event_id: EventId,
        message_id: MessageId,
    },
    /// The store rejected the event; it was not published.
    Dropped { event_id: EventId },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub produced: u64,
    pub published: u64,
    pub dropped: u64,
}

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error("failed to encode event {event_id}: {source}")]
    Encode {
        event_id: EventId,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to publish event {event_id}: {source}")]
    Publish {
        event_id: EventId,
        #[source]
        source: BusError,
    },
}

type IdGenerator = Box<dyn Fn() -> EventId + Send + Sync>;

pub struct EventProducer<S, P> {
    store: S,
    publisher: P,
    config: ProducerConfig,
    next_id: IdGenerator,
    stats: ProducerStats,
}

impl<S, P> EventProducer<S, P>
where
    S: EventStore,
    P: Publisher,
{
    pub fn new(store: S, publisher: P, config: ProducerConfig) -> Self {
        Self {
            store,
            publisher,
            config,
            next_id: Box::new(EventId::generate),
            stats: ProducerStats::default(),
        }
    }

    /// Replace the id source (deterministic ids in tests and replays).
    pub fn with_id_generator<F>(mut self, next_id: F) -> Self
    where
        F: Fn() -> EventId + Send + Sync + 'static,
    {
        self.next_id = Box::new(next_id);
        self
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.config
    }

    pub fn stats(&self) -> ProducerStats {
        self.stats
    }

    /// Run one store-then-publish step without sleeping.
    pub async fn produce_once(&mut self) -> Result<TickOutcome, ProducerError> {
        let event = self.next_event();
        let event_id = event.id().clone();

        if !self.persist(&event).await {
            return Ok(TickOutcome::Dropped { event_id });
        }

        let message_id = self.publish(&event).await?;
        Ok(TickOutcome::Published {
            event_id,
            message_id,
        })
    }

    /// Produce until `cancel` fires or a publish fails.
    ///
    /// Cancellation is observed before the store call, before the publish call
    /// and during the sleep. A cancel between the two calls leaves the event
    /// stored but unpublished.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<ProducerStats, ProducerError> {
        info!(
            topic = %self.config.topic,
            interval_ms = self.config.interval.as_millis() as u64,
            "producer started"
        );

        while !cancel.is_cancelled() {
            let event = self.next_event();

            if self.persist(&event).await {
                if cancel.is_cancelled() {
                    debug!(event_id = %event.id(), "stopping before publish; event stays stored");
                    break;
                }
                self.publish(&event).await?;
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!(
            produced = self.stats.produced,
            published = self.stats.published,
            dropped = self.stats.dropped,
            "producer stopped"
        );
        Ok(self.stats)
    }

    fn next_event(&self) -> Event {
        Event::with_id(
            (self.next_id)(),
            self.config.event_type.clone(),
            self.config.payload.clone(),
            Utc::now().trunc_subsecs(6),
        )
    }

    async fn persist(&mut self, event: &Event) -> bool {
        self.stats.produced += 1;
        match self.store.put(event).await {
            Ok(()) => {
                debug!(event_id = %event.id(), "event stored");
                true
            }
            Err(e) => {
                self.stats.dropped += 1;
                error!(event_id = %event.id(), error = %e, "failed to store event; dropping it");
                false
            }
        }
    }

    async fn publish(&mut self, event: &Event) -> Result<MessageId, ProducerError> {
        let message = Message::for_event(event).map_err(|source| ProducerError::Encode {
            event_id: event.id().clone(),
            source,
        })?;
        let message_id = message.uuid();

        if let Err(source) = self.publisher.publish(&self.config.topic, message).await {
            error!(
                event_id = %event.id(),
                message_uuid = %message_id,
                topic = %self.config.topic,
                error = %source,
                "failed to publish event"
            );
            return Err(ProducerError::Publish {
                event_id: event.id().clone(),
                source,
            });
        }

        self.stats.published += 1;
        debug!(event_id = %event.id(), message_uuid = %message_id, topic = %self.config.topic, "event published");
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU64, Ordering};

    use eventrelay_events::InMemoryBus;

    use crate::event_store::InMemoryEventStore;

    fn sequential_ids() -> impl Fn() -> EventId + Send + Sync + 'static {
        let counter = AtomicU64::new(0);
        move || EventId::new_unchecked(format!("e{}", counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    fn fast_config() -> ProducerConfig {
        ProducerConfig {
            interval: Duration::from_millis(5),
            ..ProducerConfig::default()
        }
    }

    fn producer(
        store: &Arc<InMemoryEventStore>,
        bus: &InMemoryBus,
    ) -> EventProducer<Arc<InMemoryEventStore>, InMemoryBus> {
        EventProducer::new(store.clone(), bus.clone(), fast_config()).with_id_generator(sequential_ids())
    }

    fn published_ids(bus: &InMemoryBus) -> Vec<String> {
        bus.published("events")
            .iter()
            .map(|m| Event::from_wire(m.payload()).unwrap().id().to_string())
            .collect()
    }

    #[tokio::test]
    async fn published_payload_decodes_to_the_stored_event() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        let mut producer = producer(&store, &bus);

        let outcome = producer.produce_once().await.unwrap();

        let published = bus.published("events");
        assert_eq!(published.len(), 1);
        let TickOutcome::Published { event_id, message_id } = outcome.clone() else {
            panic!("expected a publish, got {outcome:?}");
        };
        assert_eq!(published[0].uuid(), message_id);

        let decoded = Event::from_wire(published[0].payload()).unwrap();
        let stored = store.get(&event_id).await.unwrap().unwrap();
        assert_eq!(decoded, stored);
        assert_eq!(decoded.event_type(), "example_event");
        assert_eq!(decoded.payload(), "Hello, World!");
    }

    #[tokio::test]
    async fn store_failure_skips_the_publish_and_the_next_tick_moves_on() {
        let store = Arc::new(InMemoryEventStore::new());
        store.fail_on("e2");
        let bus = InMemoryBus::new();
        let mut producer = producer(&store, &bus);

        let outcomes = vec![
            producer.produce_once().await.unwrap(),
            producer.produce_once().await.unwrap(),
            producer.produce_once().await.unwrap(),
        ];

        assert_eq!(
            outcomes[1],
            TickOutcome::Dropped {
                event_id: EventId::from("e2")
            }
        );
        assert_eq!(published_ids(&bus), vec!["e1", "e3"]);
        assert!(store.get(&EventId::from("e2")).await.unwrap().is_none());
        assert_eq!(
            producer.stats(),
            ProducerStats {
                produced: 3,
                published: 2,
                dropped: 1
            }
        );
    }

    #[tokio::test]
    async fn publish_failure_is_an_error_after_the_event_was_stored() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        bus.close();
        let mut producer = producer(&store, &bus);

        let err = producer.produce_once().await.unwrap_err();
        assert!(matches!(
            err,
            ProducerError::Publish { ref event_id, source: BusError::Closed } if event_id.as_str() == "e1"
        ));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn run_produces_until_cancelled() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(producer(&store, &bus).run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while bus.published("events").len() < 3 {
            assert!(tokio::time::Instant::now() < deadline, "producer stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let stats = task.await.unwrap().unwrap();
        assert!(stats.published >= 3);
        assert_eq!(stats.dropped, 0);
        assert_eq!(stats.published as usize, bus.published("events").len());
        assert_eq!(store.len() as u64, stats.produced);
    }

    #[tokio::test]
    async fn run_returns_the_publish_error() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        bus.close();

        let result = producer(&store, &bus).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(ProducerError::Publish { .. })));
    }

    #[tokio::test]
    async fn run_keeps_going_after_store_failures() {
        let store = Arc::new(InMemoryEventStore::new());
        store.fail_on("e1");
        let bus = InMemoryBus::new();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(producer(&store, &bus).run(cancel.clone()));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while bus.published("events").is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "producer stalled");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.dropped, 1);
        assert_eq!(published_ids(&bus)[0], "e2");
    }

    #[tokio::test]
    async fn cancelled_before_start_produces_nothing() {
        let store = Arc::new(InMemoryEventStore::new());
        let bus = InMemoryBus::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let stats = producer(&store, &bus).run(cancel).await.unwrap();
        assert_eq!(stats, ProducerStats::default());
        assert!(store.is_empty());
    }
}
