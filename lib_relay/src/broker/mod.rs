//! # Broker Module
//!
//! The broker is an append-only, approximately length-bounded log keyed by a
//! stream identifier, read independently by many consumers. The feed connector
//! is its single writer; every fan-out session owns one [`BrokerReader`].
//!
//! Bounded retention is the only backpressure in the relay: a slow reader
//! misses trimmed records instead of holding memory hostage.
//!
//! ## Contained Modules:
//! - **`record`**: ids, events, records, cursors and the error type.
//! - **`redis_stream`**: Redis Streams (`XADD MAXLEN ~`, `XREAD BLOCK`).
//! - **`memory`**: in-process ring buffer with the same contract.

use std::time::Duration;

use async_trait::async_trait;

/// Ids, events, cursors and broker errors.
pub mod record;
/// In-process bounded ring buffer broker.
pub mod memory;
/// Redis Streams broker.
pub mod redis_stream;

pub use memory::MemoryBroker;
pub use record::{BrokerError, BrokerRecord, Cursor, RecordId, StreamEvent};
pub use redis_stream::RedisStreamBroker;

/// Write side of the broker, shared by the connector and the session factory.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Appends `event` to `stream_key`, trimming the log to roughly
    /// `approx_max_len` entries, and returns the assigned id.
    async fn append(
        &self,
        stream_key: &str,
        event: &StreamEvent,
        approx_max_len: usize,
    ) -> Result<RecordId, BrokerError>;

    /// Opens an independent reader. Blocking reads on one reader never delay
    /// another reader or the writer.
    async fn reader(&self) -> Result<Box<dyn BrokerReader>, BrokerError>;
}

/// Read side of the broker, owned by exactly one consumer.
#[async_trait]
pub trait BrokerReader: Send {
    /// Resolves "now" into a concrete cursor positioned after the newest
    /// record currently stored (or before everything if the stream is empty).
    async fn pin_now(&mut self, stream_key: &str) -> Result<Cursor, BrokerError>;

    /// Returns up to `max_count` records newer than `after`, in append order,
    /// waiting at most `block` for the first one. An empty batch means the
    /// wait elapsed.
    async fn read(
        &mut self,
        stream_key: &str,
        after: &Cursor,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError>;
}
