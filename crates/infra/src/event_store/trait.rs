use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use eventrelay_core::EventId;
use eventrelay_events::Event;

/// Event store operation error.
///
/// These are **infrastructure errors** (storage, identity clashes) as opposed to
/// domain errors (validation).
///
/// ## Error Categories
///
/// - **Conflict**: the id is already stored with a different record
/// - **Invalid**: the event fails validation and was not written
/// - **Backend**: the storage backend is unreachable or rejected the operation
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} is already stored with different content")]
    Conflict(EventId),

    #[error("invalid event: {0}")]
    Invalid(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Durable, id-keyed event store.
///
/// The store is the **source of truth**: the producer persists every event here
/// before publishing it, so an event on the bus is always recoverable from the store.
///
/// ## Put Semantics
///
/// `put()`:
/// - Rejects events that fail [`Event::validate`]
/// - Is idempotent per id: re-putting an identical record is `Ok`
/// - Never overwrites: re-putting a *different* record under a stored id is
///   [`StoreError::Conflict`]
/// - Is durable once it returns `Ok`
///
/// ## Get Semantics
///
/// `get()` returns the stored record, or `None` when the id is unknown.
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn put(&self, event: &Event) -> Result<(), StoreError>;

    async fn get(&self, id: &EventId) -> Result<Option<Event>, StoreError>;
}

#[async_trait]
impl<S> EventStore for Arc<S>
where
    S: EventStore + ?Sized,
{
    async fn put(&self, event: &Event) -> Result<(), StoreError> {
        (**self).put(event).await
    }

    async fn get(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        (**self).get(id).await
    }
}

/// Shared validation for every backend.
pub(crate) fn validate(event: &Event) -> Result<(), StoreError> {
    event
        .validate()
        .map_err(|e| StoreError::Invalid(format!("{}: {e}", event.id())))
}
