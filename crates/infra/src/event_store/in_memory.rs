use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

use eventrelay_core::EventId;
use eventrelay_events::Event;

use super::r#trait::{validate, EventStore, StoreError};

/// In-memory event store.
///
/// Intended for tests/dev. Not optimized for performance.
///
/// `fail_on()` makes `put` fail for chosen ids so callers can exercise the
/// persistence-failure path without a real backend.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    events: HashMap<EventId, Event>,
    order: Vec<EventId>,
    failing: HashSet<EventId>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `put` of `id` fail with [`StoreError::Backend`].
    pub fn fail_on(&self, id: impl Into<EventId>) {
        if let Ok(mut inner) = self.inner.write() {
            inner.failing.insert(id.into());
        }
    }

    /// All stored events, in first-put order.
    pub fn events(&self) -> Vec<Event> {
        self.inner
            .read()
            .map(|inner| {
                inner
                    .order
                    .iter()
                    .filter_map(|id| inner.events.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn put(&self, event: &Event) -> Result<(), StoreError> {
        validate(event)?;

        let mut inner = self
            .inner
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;

        if inner.failing.contains(event.id()) {
            return Err(StoreError::Backend(format!(
                "injected failure for event {}",
                event.id()
            )));
        }

        match inner.events.get(event.id()) {
            Some(existing) if existing == event => Ok(()),
            Some(_) => Err(StoreError::Conflict(event.id().clone())),
            None => {
                inner.order.push(event.id().clone());
                inner.events.insert(event.id().clone(), event.clone());
                Ok(())
            }
        }
    }

    async fn get(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))?;
        Ok(inner.events.get(id).cloned())
    }
}
