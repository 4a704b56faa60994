//! Postgres-backed event store implementation.
//!
//! Events live in a single `events` table keyed by `id`:
//!
//! ```text
//! id TEXT PRIMARY KEY | event_type TEXT | payload TEXT | occurred_at TIMESTAMPTZ | stored_at TIMESTAMPTZ
//! ```
//!
//! ## Put
//!
//! `INSERT ... ON CONFLICT (id) DO NOTHING`. When nothing was inserted the
//! stored row is read back and compared: identical means the put was a retry
//! (`Ok`), different means `StoreError::Conflict`.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError | Scenario |
//! |------------|----------------------|------------|----------|
//! | Database (check / not-null violation) | `23514`, `23502` | `Invalid` | Row rejected by the schema |
//! | Database (other) | Any other | `Backend` | Other database errors |
//! | PoolClosed / PoolTimedOut / Io | N/A | `Backend` | Connection problems |
//! | Other | N/A | `Backend` | Anything else |
//!
//! `PostgresEventStore` is `Send + Sync`; all operations go through the SQLx pool.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use async_trait::async_trait;
use eventrelay_core::EventId;
use eventrelay_events::Event;

use super::r#trait::{validate, EventStore, StoreError};

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id          TEXT PRIMARY KEY,
    event_type  TEXT NOT NULL,
    payload     TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    stored_at   TIMESTAMPTZ NOT NULL DEFAULT now()
)
"#;

/// Postgres-backed event store.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect a small pool to `database_url`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `events` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::query(CREATE_EVENTS_TABLE)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventStore for PostgresEventStore {
    #[instrument(skip(self, event), fields(event_id = %event.id()), err)]
    async fn put(&self, event: &Event) -> Result<(), StoreError> {
        validate(event)?;

        let result = sqlx::query(
            r#"
            INSERT INTO events (id, event_type, payload, occurred_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.id().as_str())
        .bind(event.event_type())
        .bind(event.payload())
        .bind(event.timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("put", e))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        // Nothing inserted: the id is taken.
        match self.get(event.id()).await? {
            Some(existing) if same_record(&existing, event) => {
                debug!("event already stored; put is a no-op");
                Ok(())
            }
            _ => Err(StoreError::Conflict(event.id().clone())),
        }
    }

    #[instrument(skip(self), fields(event_id = %id), err)]
    async fn get(&self, id: &EventId) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, event_type, payload, occurred_at
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.map(|r| event_from_row(&r))
            .transpose()
            .map_err(|e| StoreError::Backend(format!("failed to decode event row: {e}")))
    }
}

fn event_from_row(row: &PgRow) -> Result<Event, sqlx::Error> {
    let id: String = row.try_get("id")?;
    let event_type: String = row.try_get("event_type")?;
    let payload: String = row.try_get("payload")?;
    let occurred_at: DateTime<Utc> = row.try_get("occurred_at")?;
    Ok(Event::with_id(
        EventId::new_unchecked(id),
        event_type,
        payload,
        occurred_at,
    ))
}

/// Record equality at the precision Postgres keeps (microseconds).
fn same_record(stored: &Event, candidate: &Event) -> bool {
    stored.id() == candidate.id()
        && stored.event_type() == candidate.event_type()
        && stored.payload() == candidate.payload()
        && stored.timestamp().timestamp_micros() == candidate.timestamp().timestamp_micros()
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23514") | Some("23502") => StoreError::Invalid(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Backend(format!("timed out waiting for a connection in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn e1_at(nanos: u32) -> Event {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(nanos as i64);
        Event::with_id(EventId::from("e1"), "example_event", "Hello, World!", ts)
    }

    #[test]
    fn same_record_ignores_sub_microsecond_precision() {
        assert!(same_record(&e1_at(1_000), &e1_at(1_999)));
        assert!(!same_record(&e1_at(1_000), &e1_at(2_000)));
    }

    #[test]
    fn same_record_compares_content() {
        let other = Event::with_id(EventId::from("e1"), "example_event", "changed", e1_at(0).timestamp());
        assert!(!same_record(&e1_at(0), &other));
    }

    #[test]
    fn pool_errors_map_to_backend() {
        assert!(matches!(
            map_sqlx_error("put", sqlx::Error::PoolClosed),
            StoreError::Backend(_)
        ));
        assert!(matches!(
            map_sqlx_error("get", sqlx::Error::PoolTimedOut),
            StoreError::Backend(_)
        ));
    }
}
