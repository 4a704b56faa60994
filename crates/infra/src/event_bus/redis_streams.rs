//! Redis Streams-backed message bus (durable, at-least-once delivery).
//!
//! This implementation uses Redis Streams (XADD/XREADGROUP) to provide:
//! - **Durable delivery**: Messages persist until acknowledged
//! - **At-least-once**: Unacknowledged entries are reclaimed and redelivered
//! - **Consumer groups**: Each subscription reads through a consumer group
//! - **Dead-letter handling**: Messages that keep failing go to a DLQ stream
//!
//! ## Architecture
//!
//! - **Stream Key**: one stream per topic (the topic name is the key)
//! - **Consumer Groups**: `<topic>_subscription` unless configured otherwise
//! - **Consumers**: named consumers within the group (`eventrelay-<uuid>` by default)
//! - **Dead-Letter Queue**: `<topic>:dlq`
//!
//! ## Entry Layout
//!
//! ```text
//! XADD <topic> * uuid <message uuid> payload <bytes> metadata <json object>
//! ```
//!
//! ## Settling
//!
//! - `ack`: XACK
//! - `nack`: the entry stays pending in Redis and the same message is handed
//!   back to the subscription right away. After `max_retries` redeliveries it
//!   is copied to the DLQ and acked instead.
//! - Entries left pending by a crashed consumer are claimed (XCLAIM) once they
//!   have been idle for `claim_min_idle`.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{
    StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadOptions, StreamReadReply,
};
use redis::AsyncCommands;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use eventrelay_core::MessageId;
use eventrelay_events::{Acknowledger, BusError, Delivery, Message, Publisher, Subscriber, Subscription};

/// Default max redeliveries before a message goes to the DLQ
const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default idle time after which another consumer's pending entry is reclaimed
const DEFAULT_CLAIM_MIN_IDLE: Duration = Duration::from_secs(60);

/// Default XREADGROUP block time
const DEFAULT_BLOCK: Duration = Duration::from_millis(1000);

/// Default number of entries read per round trip
const DEFAULT_BATCH_SIZE: usize = 10;

/// Pause after a failed read before trying again
const READ_ERROR_BACKOFF: Duration = Duration::from_secs(1);

const FIELD_UUID: &str = "uuid";
const FIELD_PAYLOAD: &str = "payload";
const FIELD_METADATA: &str = "metadata";
const FIELD_ORIGINAL_ENTRY_ID: &str = "original_entry_id";
const FIELD_ATTEMPTS: &str = "attempts";
const FIELD_FAILED_AT: &str = "failed_at";

const DECODE_ERROR_METADATA: &str = "decode_error";

#[derive(Debug, Clone)]
pub struct RedisStreamsConfig {
    /// Consumer group for every subscription. `None` means `<topic>_subscription`.
    pub consumer_group: Option<String>,
    /// Consumer name within the group.
    pub consumer_name: String,
    pub max_retries: u32,
    pub claim_min_idle: Duration,
    pub block: Duration,
    pub batch_size: usize,
}

impl Default for RedisStreamsConfig {
    fn default() -> Self {
        Self {
            consumer_group: None,
            consumer_name: format!("eventrelay-{}", uuid::Uuid::now_v7()),
            max_retries: DEFAULT_MAX_RETRIES,
            claim_min_idle: DEFAULT_CLAIM_MIN_IDLE,
            block: DEFAULT_BLOCK,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

impl RedisStreamsConfig {
    pub fn group_for(&self, topic: &str) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| format!("{topic}_subscription"))
    }
}

pub fn dlq_key(topic: &str) -> String {
    format!("{topic}:dlq")
}

#[derive(Clone)]
pub struct RedisStreamsBus {
    client: redis::Client,
    conn: MultiplexedConnection,
    config: Arc<RedisStreamsConfig>,
}

impl core::fmt::Debug for RedisStreamsBus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisStreamsBus")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStreamsBus {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379`).
    pub async fn connect(
        redis_url: impl AsRef<str>,
        config: RedisStreamsConfig,
    ) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| BusError::Connection(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            conn,
            config: Arc::new(config),
        })
    }

    /// Ensure a consumer group exists (idempotent).
    ///
    /// `MKSTREAM` creates the stream if needed; the group starts at `0` so
    /// entries published before the first subscribe are still delivered.
    pub async fn ensure_consumer_group(&self, topic: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> =
            conn.xgroup_create_mkstream(topic, group, "0").await;

        match created {
            Ok(_) => {
                info!(topic, group, "created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(BusError::Subscribe {
                topic: topic.to_string(),
                reason: format!("XGROUP CREATE failed: {e}"),
            }),
        }
    }
}

#[async_trait]
impl Publisher for RedisStreamsBus {
    #[instrument(skip(self, message), fields(message_uuid = %message.uuid()), err)]
    async fn publish(&self, topic: &str, message: Message) -> Result<(), BusError> {
        let fields = encode_fields(&message).map_err(|reason| BusError::Publish {
            topic: topic.to_string(),
            reason,
        })?;

        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(topic, "*", &fields)
            .await
            .map_err(|e| BusError::Publish {
                topic: topic.to_string(),
                reason: format!("XADD failed: {e}"),
            })?;

        Ok(())
    }
}

#[async_trait]
impl Subscriber for RedisStreamsBus {
    async fn subscribe(&self, topic: &str) -> Result<Subscription, BusError> {
        let group = self.config.group_for(topic);
        self.ensure_consumer_group(topic, &group).await?;

        // Blocking reads get their own connection so they don't stall acks and publishes.
        let read_conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| BusError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;

        let (tx, rx) = mpsc::channel(self.config.batch_size.max(1));
        let reader = StreamReader {
            stream: Arc::new(StreamRef {
                topic: topic.to_string(),
                group,
                conn: self.conn.clone(),
                max_retries: self.config.max_retries,
            }),
            read_conn,
            config: self.config.clone(),
            tx,
        };
        tokio::spawn(reader.run());

        Ok(Subscription::from_receiver(topic, rx))
    }
}

/// Stream + group a delivery belongs to, shared by every acker of a subscription.
struct StreamRef {
    topic: String,
    group: String,
    conn: MultiplexedConnection,
    max_retries: u32,
}

impl StreamRef {
    async fn ack(&self, entry_id: &str) -> Result<(), BusError> {
        let mut conn = self.conn.clone();
        let _: u64 = conn
            .xack(&self.topic, &self.group, &[entry_id])
            .await
            .map_err(|e| BusError::Acknowledge(format!("XACK {entry_id} failed: {e}")))?;
        Ok(())
    }

    /// Copy the message to the DLQ, then ack the original entry.
    async fn dead_letter(&self, entry_id: &str, message: &Message, attempts: u32) -> Result<(), BusError> {
        let fields = dead_letter_fields(entry_id, message, attempts, chrono::Utc::now())
            .map_err(BusError::Acknowledge)?;

        let mut conn = self.conn.clone();
        let _: String = conn
            .xadd(dlq_key(&self.topic), "*", &fields)
            .await
            .map_err(|e| BusError::Acknowledge(format!("DLQ XADD failed: {e}")))?;

        warn!(
            topic = %self.topic,
            entry_id,
            message_uuid = %message.uuid(),
            attempts,
            "message sent to dead-letter queue"
        );

        self.ack(entry_id).await
    }

    fn may_deliver(&self, attempt: u32) -> bool {
        may_deliver(attempt, self.max_retries)
    }
}

struct RedisAcker {
    stream: Arc<StreamRef>,
    entry_id: String,
    attempt: u32,
    redeliver: mpsc::Sender<Delivery>,
}

#[async_trait]
impl Acknowledger for RedisAcker {
    async fn ack(&self, _message: &Message) -> Result<(), BusError> {
        self.stream.ack(&self.entry_id).await
    }

    async fn nack(&self, message: &Message) -> Result<(), BusError> {
        let attempt = next_attempt(self.attempt);
        if !self.stream.may_deliver(attempt) {
            return self
                .stream
                .dead_letter(&self.entry_id, message, self.attempt)
                .await;
        }

        let next = RedisAcker {
            stream: self.stream.clone(),
            entry_id: self.entry_id.clone(),
            attempt,
            redeliver: self.redeliver.clone(),
        };
        let delivery = Delivery::new(message.clone(), Arc::new(next)).with_attempt(attempt);

        // The nacking consumer is the only reader of this channel, so never wait
        // on it; a full buffer leaves the entry pending for the reclaim pass.
        if let Err(e) = self.redeliver.try_send(delivery) {
            debug!(
                topic = %self.stream.topic,
                entry_id = %self.entry_id,
                error = %e,
                "local redelivery skipped; entry stays pending"
            );
        }
        Ok(())
    }
}

struct StreamReader {
    stream: Arc<StreamRef>,
    read_conn: MultiplexedConnection,
    config: Arc<RedisStreamsConfig>,
    tx: mpsc::Sender<Delivery>,
}

impl StreamReader {
    async fn run(mut self) {
        let topic = self.stream.topic.clone();
        debug!(topic = %topic, group = %self.stream.group, "stream reader started");

        let mut last_reclaim: Option<Instant> = None;
        while !self.tx.is_closed() {
            let due = last_reclaim.is_none_or(|t| t.elapsed() >= self.config.claim_min_idle);
            if due {
                last_reclaim = Some(Instant::now());
                if let Err(e) = self.reclaim().await {
                    warn!(topic = %topic, error = %e, "reclaiming pending entries failed");
                }
            }

            match self.read_new().await {
                Ok(()) => {}
                Err(e) => {
                    error!(topic = %topic, error = %e, "reading from stream failed");
                    tokio::time::sleep(READ_ERROR_BACKOFF).await;
                }
            }
        }

        debug!(topic = %topic, "stream reader stopped");
    }

    async fn read_new(&mut self) -> Result<(), BusError> {
        let options = StreamReadOptions::default()
            .group(&self.stream.group, &self.config.consumer_name)
            .count(self.config.batch_size)
            .block(self.config.block.as_millis() as usize);

        let reply: Option<StreamReadReply> = self
            .read_conn
            .xread_options(&[&self.stream.topic], &[">"], &options)
            .await
            .map_err(|e| BusError::Connection(format!("XREADGROUP failed: {e}")))?;

        let entries = reply
            .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect::<Vec<_>>())
            .unwrap_or_default();

        for entry in entries {
            self.deliver(entry, 1).await;
        }
        Ok(())
    }

    /// Claim entries other consumers left pending for too long.
    async fn reclaim(&mut self) -> Result<(), BusError> {
        let mut conn = self.stream.conn.clone();
        let pending: StreamPendingCountReply = conn
            .xpending_count(&self.stream.topic, &self.stream.group, "-", "+", self.config.batch_size)
            .await
            .map_err(|e| BusError::Connection(format!("XPENDING failed: {e}")))?;

        let min_idle_ms = self.config.claim_min_idle.as_millis() as usize;
        let stale: Vec<(String, u32)> = pending
            .ids
            .into_iter()
            .filter(|p| p.last_delivered_ms >= min_idle_ms)
            .map(|p| (p.id, reclaim_attempt(p.times_delivered)))
            .collect();
        if stale.is_empty() {
            return Ok(());
        }

        let ids: Vec<&str> = stale.iter().map(|(id, _)| id.as_str()).collect();
        let claimed: StreamClaimReply = conn
            .xclaim(
                &self.stream.topic,
                &self.stream.group,
                &self.config.consumer_name,
                min_idle_ms,
                &ids,
            )
            .await
            .map_err(|e| BusError::Connection(format!("XCLAIM failed: {e}")))?;

        for entry in claimed.ids {
            let attempt = stale
                .iter()
                .find(|(id, _)| *id == entry.id)
                .map(|(_, n)| *n)
                .unwrap_or(2);
            info!(topic = %self.stream.topic, entry_id = %entry.id, attempt, "reclaimed stale entry");
            self.deliver(entry, attempt).await;
        }
        Ok(())
    }

    async fn deliver(&self, entry: StreamId, attempt: u32) {
        let message = match decode_entry(&entry) {
            Ok(message) => message,
            Err(reason) => {
                // Not a message we can ever handle: park whatever payload it has in the DLQ.
                error!(topic = %self.stream.topic, entry_id = %entry.id, %reason, "undecodable stream entry");
                let raw = undecodable_message(&entry, reason);
                if let Err(e) = self.stream.dead_letter(&entry.id, &raw, attempt).await {
                    error!(topic = %self.stream.topic, entry_id = %entry.id, error = %e, "dead-lettering undecodable entry failed");
                }
                return;
            }
        };

        if !self.stream.may_deliver(attempt) {
            if let Err(e) = self.stream.dead_letter(&entry.id, &message, attempt).await {
                error!(topic = %self.stream.topic, entry_id = %entry.id, error = %e, "dead-lettering failed");
            }
            return;
        }

        let acker = RedisAcker {
            stream: self.stream.clone(),
            entry_id: entry.id.clone(),
            attempt,
            redeliver: self.tx.clone(),
        };
        let delivery = Delivery::new(message, Arc::new(acker)).with_attempt(attempt);
        if self.tx.send(delivery).await.is_err() {
            debug!(topic = %self.stream.topic, entry_id = %entry.id, "subscription dropped; entry stays pending");
        }
    }
}

/// Whether the `attempt`-th delivery (1-based) of an entry may still reach a
/// consumer: the first delivery plus up to `max_retries` redeliveries.
fn may_deliver(attempt: u32, max_retries: u32) -> bool {
    attempt.saturating_sub(1) <= max_retries
}

fn next_attempt(attempt: u32) -> u32 {
    attempt.saturating_add(1)
}

/// Attempt number for an entry claimed after `times_delivered` earlier deliveries.
fn reclaim_attempt(times_delivered: usize) -> u32 {
    u32::try_from(times_delivered).unwrap_or(u32::MAX).saturating_add(1)
}

/// Stand-in message for an entry that cannot be decoded; keeps whatever payload it had.
fn undecodable_message(entry: &StreamId, reason: String) -> Message {
    let payload: Vec<u8> = entry.get(FIELD_PAYLOAD).unwrap_or_default();
    Message::new(MessageId::new(), payload).with_metadata(DECODE_ERROR_METADATA, reason)
}

fn dead_letter_fields(
    entry_id: &str,
    message: &Message,
    attempts: u32,
    failed_at: chrono::DateTime<chrono::Utc>,
) -> Result<Vec<(&'static str, Vec<u8>)>, String> {
    let mut fields = encode_fields(message)?;
    fields.push((FIELD_ORIGINAL_ENTRY_ID, entry_id.as_bytes().to_vec()));
    fields.push((FIELD_ATTEMPTS, attempts.to_string().into_bytes()));
    fields.push((FIELD_FAILED_AT, failed_at.to_rfc3339().into_bytes()));
    Ok(fields)
}

fn encode_fields(message: &Message) -> Result<Vec<(&'static str, Vec<u8>)>, String> {
    let metadata = serde_json::to_vec(message.metadata())
        .map_err(|e| format!("metadata serialization failed: {e}"))?;
    Ok(vec![
        (FIELD_UUID, message.uuid().to_string().into_bytes()),
        (FIELD_PAYLOAD, message.payload().to_vec()),
        (FIELD_METADATA, metadata),
    ])
}

fn decode_entry(entry: &StreamId) -> Result<Message, String> {
    let uuid: String = entry
        .get(FIELD_UUID)
        .ok_or_else(|| "missing uuid field".to_string())?;
    let uuid = MessageId::from_str(&uuid).map_err(|e| e.to_string())?;
    let payload: Vec<u8> = entry
        .get(FIELD_PAYLOAD)
        .ok_or_else(|| "missing payload field".to_string())?;
    let metadata: BTreeMap<String, String> = match entry.get::<Vec<u8>>(FIELD_METADATA) {
        Some(raw) => serde_json::from_slice(&raw).map_err(|e| format!("invalid metadata: {e}"))?,
        None => BTreeMap::new(),
    };

    Ok(metadata
        .into_iter()
        .fold(Message::new(uuid, payload), |m, (k, v)| m.with_metadata(k, v)))
}
