//! # Broker Records
//!
//! Value types shared by every broker implementation: the immutable
//! [`StreamEvent`] produced by the feed connector, the id-stamped
//! [`BrokerRecord`] handed back to readers, and the per-reader [`Cursor`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised by broker implementations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The Redis driver reported a failure (connection, protocol or command).
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    /// A stored entry or id could not be interpreted.
    #[error("failed to decode broker data: {0}")]
    Decode(String),
    /// The broker cannot serve the request right now (closed reader, lost worker).
    #[error("broker unavailable: {0}")]
    Unavailable(String),
}

/// # Record Id
///
/// Broker-assigned position of a record within one stream key. Ordering is
/// `(millis, seq)`, which matches the Redis stream id ordering, and the
/// textual form is `"<millis>-<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct RecordId {
    /// Wall-clock milliseconds component.
    pub millis: u64,
    /// Sequence number within the same millisecond.
    pub seq: u64,
}

impl RecordId {
    /// The id that sorts before every real record.
    pub const ZERO: RecordId = RecordId { millis: 0, seq: 0 };

    /// Builds an id from its two components.
    pub fn new(millis: u64, seq: u64) -> Self {
        Self { millis, seq }
    }

    /// Smallest id strictly greater than `self` that a generator may hand out
    /// at wall-clock time `now_ms`.
    pub fn successor(&self, now_ms: u64) -> RecordId {
        if now_ms > self.millis {
            RecordId::new(now_ms, 0)
        } else {
            RecordId::new(self.millis, self.seq + 1)
        }
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.millis, self.seq)
    }
}

impl FromStr for RecordId {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (millis, seq) = s
            .split_once('-')
            .ok_or_else(|| BrokerError::Decode(format!("record id without separator: {s:?}")))?;
        let millis = millis
            .parse()
            .map_err(|_| BrokerError::Decode(format!("bad millis in record id {s:?}")))?;
        let seq = seq
            .parse()
            .map_err(|_| BrokerError::Decode(format!("bad sequence in record id {s:?}")))?;
        Ok(RecordId { millis, seq })
    }
}

/// # Stream Event
///
/// One parsed upstream frame. Created once by the connector and never
/// mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    /// Value of the SSE `event:` field, empty when the frame had none.
    pub event_name: String,
    /// Parsed JSON payload, or the raw text wrapped as a JSON string when the
    /// data was not valid JSON.
    pub payload: Value,
    /// Unix milliseconds at which the connector flushed the frame.
    pub ingestion_time_ms: i64,
}

impl StreamEvent {
    /// Builds an event from raw SSE data. Malformed JSON never fails: it is
    /// kept as an opaque string value.
    pub fn from_raw(event_name: impl Into<String>, data: &str, ingestion_time_ms: i64) -> Self {
        let payload = serde_json::from_str::<Value>(data)
            .unwrap_or_else(|_| Value::String(data.to_string()));
        Self {
            event_name: event_name.into(),
            payload,
            ingestion_time_ms,
        }
    }

    /// JSON text of the payload as it is stored in the broker's `data` field.
    pub fn data_text(&self) -> String {
        self.payload.to_string()
    }
}

/// A [`StreamEvent`] stamped with its broker id.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerRecord {
    /// Id assigned by the broker on append.
    pub id: RecordId,
    /// The stored event.
    pub event: StreamEvent,
}

/// # Cursor
///
/// A reader's position. `Now` only matches records appended after the read
/// is issued; `After(id)` matches records strictly newer than `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Only future records.
    Now,
    /// Records with an id strictly greater than the contained one.
    After(RecordId),
}

impl Cursor {
    /// Moves the cursor to `id` unless that would move it backwards.
    pub fn advance(&mut self, id: RecordId) {
        match self {
            Cursor::After(current) if *current >= id => {}
            _ => *self = Cursor::After(id),
        }
    }

    /// Last id consumed through this cursor, if it has been pinned.
    pub fn last_id(&self) -> Option<RecordId> {
        match self {
            Cursor::Now => None,
            Cursor::After(id) => Some(*id),
        }
    }

    /// The id argument a Redis `XREAD` expects for this cursor.
    pub fn as_stream_id(&self) -> String {
        match self {
            Cursor::Now => "$".to_string(),
            Cursor::After(id) => id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_ids_parse_and_order_like_redis() {
        let a: RecordId = "1700000000000-0".parse().unwrap();
        let b: RecordId = "1700000000000-7".parse().unwrap();
        let c: RecordId = "1700000000001-0".parse().unwrap();
        assert!(a < b && b < c);
        assert_eq!(b.to_string(), "1700000000000-7");
        assert!("garbage".parse::<RecordId>().is_err());
        assert!("12-x".parse::<RecordId>().is_err());
    }

    #[test]
    fn successor_is_strictly_greater_even_when_the_clock_stalls() {
        let last = RecordId::new(500, 3);
        assert_eq!(last.successor(500), RecordId::new(500, 4));
        assert_eq!(last.successor(499), RecordId::new(500, 4));
        assert_eq!(last.successor(501), RecordId::new(501, 0));
    }

    #[test]
    fn json_data_is_kept_structured() {
        let event = StreamEvent::from_raw("foo", r#"{"a":1}"#, 10);
        assert_eq!(event.payload, json!({"a": 1}));
        assert_eq!(event.data_text(), r#"{"a":1}"#);
    }

    #[test]
    fn malformed_data_becomes_an_opaque_string() {
        let event = StreamEvent::from_raw("", "not-json", 10);
        assert_eq!(event.payload, Value::String("not-json".into()));
        let stored = event.data_text();
        assert_eq!(serde_json::from_str::<Value>(&stored).unwrap(), json!("not-json"));
    }

    #[test]
    fn cursor_never_moves_backwards() {
        let mut cursor = Cursor::Now;
        assert_eq!(cursor.as_stream_id(), "$");
        cursor.advance(RecordId::new(10, 2));
        cursor.advance(RecordId::new(10, 1));
        assert_eq!(cursor, Cursor::After(RecordId::new(10, 2)));
        cursor.advance(RecordId::new(11, 0));
        assert_eq!(cursor.last_id(), Some(RecordId::new(11, 0)));
        assert_eq!(cursor.as_stream_id(), "11-0");
    }
}
