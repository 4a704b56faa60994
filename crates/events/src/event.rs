use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use eventrelay_core::{DomainError, DomainResult, EventId};

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts; a persisted event is never changed)
/// - **identified** by `id`, which is also the store's primary key
/// - carried on the bus in their JSON **wire form**
///
/// ## Wire Format
///
/// ```text
/// {"_id":"e1","event_type":"example_event","payload":"Hello, World!","timestamp":"2024-01-01T00:00:00Z"}
/// ```
///
/// Key names and order are part of the contract with existing consumers.
/// `timestamp` is RFC3339 and is informational only (not used for ordering).
///
/// Delivery is at-least-once: consumers must treat a second delivery of the
/// same `id` as a duplicate of the same logical event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "_id")]
    id: EventId,
    event_type: String,
    payload: String,
    timestamp: DateTime<Utc>,
}

impl Event {
    /// Create a new event with a freshly minted id and the current time.
    ///
    /// The timestamp is truncated to microseconds, the precision the store keeps.
    pub fn new(event_type: impl Into<String>, payload: impl Into<String>) -> Self {
        Self::with_id(
            EventId::generate(),
            event_type,
            payload,
            Utc::now().trunc_subsecs(6),
        )
    }

    /// Create an event with explicit identity and time (tests, replays).
    pub fn with_id(
        id: EventId,
        event_type: impl Into<String>,
        payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            payload: payload.into(),
            timestamp,
        }
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Serialize into the JSON wire form.
    pub fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse the JSON wire form. Does not validate; see [`Event::validate`].
    pub fn from_wire(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Check the invariants a decoded event must satisfy.
    pub fn validate(&self) -> DomainResult<()> {
        if self.id.is_empty() {
            return Err(DomainError::invalid_id("event _id must not be empty"));
        }
        if self.event_type.trim().is_empty() {
            return Err(DomainError::validation("event_type must not be empty"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const E1_WIRE: &str = r#"{"_id":"e1","event_type":"example_event","payload":"Hello, World!","timestamp":"2024-01-01T00:00:00Z"}"#;

    fn e1() -> Event {
        Event::with_id(
            EventId::from("e1"),
            "example_event",
            "Hello, World!",
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        )
    }

    #[test]
    fn serializes_to_exact_wire_bytes() {
        let bytes = e1().to_wire().unwrap();
        assert_eq!(String::from_utf8(bytes).unwrap(), E1_WIRE);
    }

    #[test]
    fn decodes_wire_form() {
        let event = Event::from_wire(E1_WIRE.as_bytes()).unwrap();
        assert_eq!(event, e1());
        assert!(event.validate().is_ok());
    }

    #[test]
    fn decodes_timestamps_with_offsets_into_utc() {
        let raw = r#"{"_id":"e1","event_type":"example_event","payload":"Hello, World!","timestamp":"2024-01-01T02:00:00+02:00"}"#;
        let event = Event::from_wire(raw.as_bytes()).unwrap();
        assert_eq!(event.timestamp(), e1().timestamp());
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(Event::from_wire(b"not json").is_err());
        assert!(Event::from_wire(br#"{"_id":"e1"}"#).is_err());
        assert!(
            Event::from_wire(
                br#"{"_id":"e1","event_type":"t","payload":"p","timestamp":"yesterday"}"#
            )
            .is_err()
        );
    }

    #[test]
    fn validate_rejects_blank_identity_and_type() {
        let no_id = Event::with_id(EventId::new_unchecked(""), "t", "p", Utc::now());
        assert!(matches!(no_id.validate(), Err(DomainError::InvalidId(_))));

        let no_type = Event::with_id(EventId::from("e1"), " ", "p", Utc::now());
        assert!(matches!(no_type.validate(), Err(DomainError::Validation(_))));
    }

    #[test]
    fn new_events_get_distinct_ids() {
        let a = Event::new("example_event", "Hello, World!");
        let b = Event::new("example_event", "Hello, World!");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.event_type(), "example_event");
        assert_eq!(a.timestamp().timestamp_subsec_nanos() % 1_000, 0);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: whatever the producer persists is exactly what a consumer decodes.
            #[test]
            fn wire_form_preserves_every_field(
                id in "[A-Za-z0-9-]{1,40}",
                event_type in "[a-z_.]{1,30}",
                payload in any::<String>(),
                secs in 0i64..4_102_444_800i64,
                nanos in 0u32..1_000_000_000u32,
            ) {
                let timestamp = Utc.timestamp_opt(secs, nanos).unwrap();
                let event = Event::with_id(EventId::from(id.as_str()), event_type, payload, timestamp);

                let decoded = Event::from_wire(&event.to_wire().unwrap()).unwrap();
                prop_assert_eq!(decoded, event);
            }
        }
    }
}
