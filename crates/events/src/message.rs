use std::collections::BTreeMap;

use eventrelay_core::MessageId;

use crate::Event;

/// Metadata key carrying the id of the event a message wraps.
pub const EVENT_ID_METADATA: &str = "event_id";

/// Metadata key carrying the type of the event a message wraps.
pub const EVENT_TYPE_METADATA: &str = "event_type";

/// Transport envelope for one published payload.
///
/// This is the unit the bus moves around. Notes:
/// - `uuid` identifies the *transport message*, not the event inside it; a
///   redelivery keeps the same `uuid`, a republish gets a new one.
/// - `payload` is opaque bytes (the serialized [`Event`] for this pipeline).
/// - `metadata` travels with the message and is never interpreted by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    uuid: MessageId,
    payload: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl Message {
    pub fn new(uuid: MessageId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            uuid,
            payload: payload.into(),
            metadata: BTreeMap::new(),
        }
    }

    /// Wrap an event's wire form in a fresh message.
    ///
    /// The event id and type are copied into metadata so transport-level logs
    /// can be correlated with the store without decoding the payload.
    pub fn for_event(event: &Event) -> Result<Self, serde_json::Error> {
        let message = Self::new(MessageId::new(), event.to_wire()?)
            .with_metadata(EVENT_ID_METADATA, event.id().as_str())
            .with_metadata(EVENT_TYPE_METADATA, event.event_type());
        Ok(message)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn uuid(&self) -> MessageId {
        self.uuid
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }
}
