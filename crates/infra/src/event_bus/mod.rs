//! Infrastructure message bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `eventrelay-events`.
//! This module provides infrastructure-backed implementations (Redis Streams).

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsBus, RedisStreamsConfig};
