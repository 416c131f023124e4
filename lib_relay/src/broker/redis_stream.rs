//! # Redis Streams Broker
//!
//! Stores relay records in a Redis stream. Writes go through a shared
//! [`ConnectionManager`] (reconnects on its own); every reader owns a
//! dedicated async connection because `XREAD BLOCK` parks the whole
//! connection on the server side for the length of the wait. A read dropped
//! mid-wait takes its connection with it and the next call dials a new one.
//!
//! Entry layout (one field per attribute):
//!
//! | field       | content                                   |
//! |-------------|-------------------------------------------|
//! | `event`     | SSE event name                            |
//! | `data`      | JSON text of the payload                  |
//! | `timestamp` | ingestion time, unix milliseconds         |

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::AsyncConnectionConfig;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use serde_json::Value;

use super::record::{BrokerError, BrokerRecord, Cursor, RecordId, StreamEvent};
use super::{Broker, BrokerReader};

/// Extra response time granted on top of a server-side block.
const READ_TIMEOUT_MARGIN: Duration = Duration::from_secs(5);

/// Redis-backed implementation of [`Broker`].
#[derive(Clone)]
pub struct RedisStreamBroker {
    client: redis::Client,
    writer: ConnectionManager,
}

impl RedisStreamBroker {
    /// Opens the client and the shared write connection.
    ///
    /// # Arguments
    /// * `url` - The redis URL (e.g., "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = redis::Client::open(url)?;
        let writer = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, writer })
    }

    /// Round-trips a `PING`, used at startup to fail fast on a bad address.
    pub async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.writer.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Broker for RedisStreamBroker {
    async fn append(
        &self,
        stream_key: &str,
        event: &StreamEvent,
        approx_max_len: usize,
    ) -> Result<RecordId, BrokerError> {
        let mut conn = self.writer.clone();
        let id: String = redis::cmd("XADD")
            .arg(stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(approx_max_len.max(1))
            .arg("*")
            .arg("event")
            .arg(&event.event_name)
            .arg("data")
            .arg(event.data_text())
            .arg("timestamp")
            .arg(event.ingestion_time_ms)
            .query_async(&mut conn)
            .await?;
        id.parse()
    }

    async fn reader(&self) -> Result<Box<dyn BrokerReader>, BrokerError> {
        Ok(Box::new(RedisStreamReader {
            client: self.client.clone(),
            conn: None,
        }))
    }
}

struct RedisStreamReader {
    client: redis::Client,
    conn: Option<MultiplexedConnection>,
}

impl RedisStreamReader {
    /// Takes the reader's connection out, opening one if needed. Callers put
    /// it back only after a complete reply, so a failed or abandoned command
    /// never leaves a half-read connection behind.
    async fn checkout(&mut self, response_timeout: Duration) -> Result<MultiplexedConnection, BrokerError> {
        let mut conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                let config = AsyncConnectionConfig::new().set_response_timeout(Some(response_timeout));
                self.client
                    .get_multiplexed_async_connection_with_config(&config)
                    .await?
            }
        };
        conn.set_response_timeout(response_timeout);
        Ok(conn)
    }
}

#[async_trait]
impl BrokerReader for RedisStreamReader {
    async fn pin_now(&mut self, stream_key: &str) -> Result<Cursor, BrokerError> {
        let mut conn = self.checkout(READ_TIMEOUT_MARGIN).await?;
        let reply: StreamRangeReply = redis::cmd("XREVRANGE")
            .arg(stream_key)
            .arg("+")
            .arg("-")
            .arg("COUNT")
            .arg(1)
            .query_async(&mut conn)
            .await?;
        self.conn = Some(conn);

        match reply.ids.first() {
            Some(newest) => Ok(Cursor::After(newest.id.parse()?)),
            None => Ok(Cursor::After(RecordId::ZERO)),
        }
    }

    async fn read(
        &mut self,
        stream_key: &str,
        after: &Cursor,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        let mut conn = self.checkout(block + READ_TIMEOUT_MARGIN).await?;

        let mut cmd = redis::cmd("XREAD");
        cmd.arg("COUNT").arg(max_count.max(1));
        // BLOCK 0 means "forever" to Redis, so a zero wait omits the option.
        let block_ms = u64::try_from(block.as_millis()).unwrap_or(u64::MAX);
        if block_ms > 0 {
            cmd.arg("BLOCK").arg(block_ms);
        }
        cmd.arg("STREAMS").arg(stream_key).arg(after.as_stream_id());

        let reply: Option<StreamReadReply> = cmd.query_async(&mut conn).await?;
        self.conn = Some(conn);

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .iter()
            .filter(|stream| stream.key == stream_key)
            .flat_map(|stream| stream.ids.iter())
            .map(decode_entry)
            .collect()
    }
}

/// Converts one stream entry back into a record. Missing fields decode to
/// empty values so foreign entries never abort a reader.
fn decode_entry(entry: &StreamId) -> Result<BrokerRecord, BrokerError> {
    let id: RecordId = entry.id.parse()?;
    let event_name: String = entry.get("event").unwrap_or_default();
    let data: Option<String> = entry.get("data");
    let ingestion_time_ms: i64 = entry.get("timestamp").unwrap_or_default();

    let payload = match data {
        None => Value::Null,
        Some(text) if text.is_empty() => Value::Null,
        Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
    };

    Ok(BrokerRecord {
        id,
        event: StreamEvent {
            event_name,
            payload,
            ingestion_time_ms,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(id: &str, fields: &[(&str, &str)]) -> StreamId {
        let mut entry = StreamId::default();
        entry.id = id.to_string();
        for (field, value) in fields {
            entry.map.insert(
                field.to_string(),
                redis::Value::BulkString(value.as_bytes().to_vec()),
            );
        }
        entry
    }

    #[test]
    fn decodes_the_stored_layout() {
        let record = decode_entry(&entry(
            "1700000000000-3",
            &[
                ("event", "TimingData"),
                ("data", r#"{"Lines":{"1":{"Position":"1"}}}"#),
                ("timestamp", "1700000000123"),
            ],
        ))
        .unwrap();
        assert_eq!(record.id, RecordId::new(1_700_000_000_000, 3));
        assert_eq!(record.event.event_name, "TimingData");
        assert_eq!(record.event.payload, json!({"Lines": {"1": {"Position": "1"}}}));
        assert_eq!(record.event.ingestion_time_ms, 1_700_000_000_123);
    }

    #[test]
    fn opaque_and_missing_fields_do_not_fail() {
        let record = decode_entry(&entry("5-0", &[("data", "\"not-json\"")])).unwrap();
        assert_eq!(record.event.payload, json!("not-json"));
        assert_eq!(record.event.event_name, "");

        let record = decode_entry(&entry("5-1", &[("data", "raw text")])).unwrap();
        assert_eq!(record.event.payload, json!("raw text"));

        let record = decode_entry(&entry("5-2", &[])).unwrap();
        assert_eq!(record.event.payload, Value::Null);
        assert_eq!(record.event.ingestion_time_ms, 0);
    }

    #[test]
    fn bad_ids_are_decode_errors() {
        assert!(matches!(
            decode_entry(&entry("nope", &[])),
            Err(BrokerError::Decode(_))
        ));
    }
}
