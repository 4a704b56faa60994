//! `eventrelay-core`: shared building blocks.
//!
//! This crate contains identifiers and the validation error model shared by the
//! event, transport and infrastructure layers (no IO, no async).

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{EventId, MessageId};
