//! Message bus client: consumer group reads, keyed produce, flush, commit
//!
//! The engine only talks to the [`Consumer`] and [`Producer`] traits. Two
//! backends implement them:
//!
//! - `file_bus`: one append-only JSONL log per topic plus SQLite-backed
//!   consumer group offsets; what the `heuristics` binary runs on
//! - `memory`: in-process broker with fault injection, for tests
//!
//! ## Delivery
//!
//! Offsets are committed explicitly. Anything consumed after the last commit
//! is redelivered after a restart, so delivery is at-least-once as long as
//! callers commit only after their produced output is flushed.

pub mod error_handler;
pub mod file_bus;
pub mod memory;
pub mod offsets;

use async_trait::async_trait;
use std::time::Duration;

pub use error_handler::{ExponentialBackoff, MaxRetriesExceeded};
pub use file_bus::{FileConsumer, FileProducer};
pub use memory::{BusOp, MemoryBus, MemoryConsumer, MemoryProducer};
pub use offsets::OffsetStore;

/// Where a consumed message came from
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BusMeta {
    pub topic: String,
    pub partition: i32,
    pub offset: u64,
}

impl std::fmt::Display for BusMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

#[derive(Debug, Clone)]
pub struct ConsumedMessage {
    /// Partitioning key; the decimal session id for telemetry
    pub key: String,
    pub payload: Vec<u8>,
    pub meta: BusMeta,
}

#[derive(Debug)]
pub enum BusError {
    Io(std::io::Error),
    Database(String),
    /// Flush did not complete in time; `pending` messages were not delivered
    FlushTimeout { pending: usize },
    Closed,
    InvalidRecord(String),
    /// Failure requested through a test broker
    Injected(String),
}

impl From<std::io::Error> for BusError {
    fn from(err: std::io::Error) -> Self {
        BusError::Io(err)
    }
}

impl From<rusqlite::Error> for BusError {
    fn from(err: rusqlite::Error) -> Self {
        BusError::Database(err.to_string())
    }
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Io(e) => write!(f, "IO error: {}", e),
            BusError::Database(e) => write!(f, "Database error: {}", e),
            BusError::FlushTimeout { pending } => {
                write!(f, "Flush timed out with {} messages outstanding", pending)
            }
            BusError::Closed => write!(f, "Bus client already closed"),
            BusError::InvalidRecord(e) => write!(f, "Invalid record: {}", e),
            BusError::Injected(e) => write!(f, "Injected failure: {}", e),
        }
    }
}

impl std::error::Error for BusError {}

/// Consumer group member
///
/// Calls never block waiting for traffic: `consume_next` returns `Ok(None)`
/// when nothing is available right now.
pub trait Consumer: Send {
    fn consume_next(&mut self) -> Result<Option<ConsumedMessage>, BusError>;

    /// Persist the position after every message returned so far
    fn commit(&mut self) -> Result<(), BusError>;

    /// Leave the group; further calls fail with [`BusError::Closed`]
    fn close(&mut self) -> Result<(), BusError>;
}

/// Keyed producer with explicit, bounded flush
#[async_trait]
pub trait Producer: Send {
    /// Enqueue a message; it is durable only after a successful flush
    fn produce(&mut self, topic: &str, key: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Deliver everything enqueued so far, or fail after `timeout`
    ///
    /// On failure nothing is lost: the undelivered messages stay queued for
    /// the next flush.
    async fn flush(&mut self, timeout: Duration) -> Result<(), BusError>;

    /// Flush, then refuse further produces
    async fn close(&mut self, timeout: Duration) -> Result<(), BusError>;

    /// Messages enqueued but not yet delivered
    fn pending(&self) -> usize;
}
