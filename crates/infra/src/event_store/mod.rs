//! Durable event store boundary.
//!
//! The producer writes every event here before it is published, so anything a
//! consumer sees on the bus can be looked up by its id.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryEventStore;
pub use postgres::PostgresEventStore;
pub use r#trait::{EventStore, StoreError};
