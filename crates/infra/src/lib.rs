//! Infrastructure layer: durable event stores, bus backends, the producer and
//! process configuration.

pub mod config;
pub mod event_bus;
pub mod event_store;
pub mod producer;


pub use config::{BusBackend, ConfigError, RelayConfig, StoreBackend};
pub use event_store::{EventStore, InMemoryEventStore, PostgresEventStore, StoreError};
pub use producer::{EventProducer, ProducerConfig, ProducerError, ProducerStats, TickOutcome};
