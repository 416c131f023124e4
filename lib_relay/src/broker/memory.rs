//! # In-Process Broker
//!
//! A bounded ring buffer per stream key with any number of independent
//! readers. Retention is exact (the log never exceeds `max_len`), ids follow
//! the Redis `<millis>-<seq>` scheme, and blocked readers are woken through a
//! shared [`Notify`] instead of polling.
//!
//! Used for single-process deployments (`--broker memory`) and by the test
//! suites, where it stands in for Redis with identical ordering guarantees.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::record::{BrokerError, BrokerRecord, Cursor, RecordId, StreamEvent};
use super::{Broker, BrokerReader};

#[derive(Default)]
struct StreamLog {
    entries: VecDeque<BrokerRecord>,
    last_id: RecordId,
}

#[derive(Default)]
struct Shared {
    streams: Mutex<HashMap<String, StreamLog>>,
    appended: Notify,
}

impl Shared {
    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, StreamLog>>, BrokerError> {
        self.streams
            .lock()
            .map_err(|_| BrokerError::Unavailable("memory broker lock poisoned".into()))
    }

    fn last_id(&self, stream_key: &str) -> Result<RecordId, BrokerError> {
        Ok(self
            .lock()?
            .get(stream_key)
            .map(|log| log.last_id)
            .unwrap_or(RecordId::ZERO))
    }

    fn collect(
        &self,
        stream_key: &str,
        after: RecordId,
        max_count: usize,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        let streams = self.lock()?;
        let Some(log) = streams.get(stream_key) else {
            return Ok(Vec::new());
        };
        let start = log.entries.partition_point(|record| record.id <= after);
        Ok(log
            .entries
            .iter()
            .skip(start)
            .take(max_count.max(1))
            .cloned()
            .collect())
    }
}

/// In-process implementation of [`Broker`].
#[derive(Clone, Default)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records currently retained for `stream_key`.
    pub fn stored(&self, stream_key: &str) -> usize {
        self.shared
            .lock()
            .map(|streams| streams.get(stream_key).map_or(0, |log| log.entries.len()))
            .unwrap_or(0)
    }
}

fn now_millis() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn append(
        &self,
        stream_key: &str,
        event: &StreamEvent,
        approx_max_len: usize,
    ) -> Result<RecordId, BrokerError> {
        let id = {
            let mut streams = self.shared.lock()?;
            let log = streams.entry(stream_key.to_string()).or_default();
            let id = log.last_id.successor(now_millis());
            log.last_id = id;
            log.entries.push_back(BrokerRecord {
                id,
                event: event.clone(),
            });
            while log.entries.len() > approx_max_len.max(1) {
                log.entries.pop_front();
            }
            id
        };
        self.shared.appended.notify_waiters();
        Ok(id)
    }

    async fn reader(&self) -> Result<Box<dyn BrokerReader>, BrokerError> {
        Ok(Box::new(MemoryReader {
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MemoryReader {
    shared: Arc<Shared>,
}

#[async_trait]
impl BrokerReader for MemoryReader {
    async fn pin_now(&mut self, stream_key: &str) -> Result<Cursor, BrokerError> {
        Ok(Cursor::After(self.shared.last_id(stream_key)?))
    }

    async fn read(
        &mut self,
        stream_key: &str,
        after: &Cursor,
        max_count: usize,
        block: Duration,
    ) -> Result<Vec<BrokerRecord>, BrokerError> {
        let deadline = tokio::time::Instant::now() + block;
        let after = match after {
            Cursor::Now => self.shared.last_id(stream_key)?,
            Cursor::After(id) => *id,
        };

        loop {
            // Register interest before looking, so an append racing with the
            // check still wakes us.
            let appended = self.shared.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let batch = self.shared.collect(stream_key, after, max_count)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }
}
