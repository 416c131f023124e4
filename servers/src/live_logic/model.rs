use lib_relay::broker::BrokerRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One record as delivered to a WebSocket client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub event: String,
    /// JSON text of the payload, exactly as stored in the broker.
    pub data: String,
    pub timestamp: i64,
    pub message_id: String,
}

impl OutboundMessage {
    /// `None` for records with neither an event name nor data; those carry
    /// nothing a client could use.
    pub fn from_record(record: &BrokerRecord) -> Option<Self> {
        let event = &record.event;
        let blank_payload = match &event.payload {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            _ => false,
        };
        if event.event_name.is_empty() && blank_payload {
            return None;
        }

        Some(Self {
            event: event.event_name.clone(),
            data: event.data_text(),
            timestamp: event.ingestion_time_ms,
            message_id: record.id.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusResponse {
    pub subscribers: usize,
    pub stream: String,
    pub status: String,
    pub connector: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
}

impl Default for HealthResponse {
    fn default() -> Self {
        Self {
            status: "healthy".to_string(),
            service: "websocket".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_relay::broker::{RecordId, StreamEvent};
    use serde_json::json;

    fn record(name: &str, payload: Value) -> BrokerRecord {
        BrokerRecord {
            id: RecordId::new(1_700_000_000_000, 2),
            event: StreamEvent {
                event_name: name.to_string(),
                payload,
                ingestion_time_ms: 1_700_000_000_001,
            },
        }
    }

    #[test]
    fn outbound_shape() {
        let message = OutboundMessage::from_record(&record("TimingData", json!({"a": 1}))).unwrap();
        let wire = serde_json::to_value(&message).unwrap();
        assert_eq!(
            wire,
            json!({
                "event": "TimingData",
                "data": "{\"a\":1}",
                "timestamp": 1_700_000_000_001_i64,
                "message_id": "1700000000000-2",
            })
        );
    }

    #[test]
    fn opaque_data_stays_a_json_string_literal() {
        let message = OutboundMessage::from_record(&record("", json!("not-json"))).unwrap();
        assert_eq!(message.data, "\"not-json\"");
    }

    #[test]
    fn blank_records_are_skipped() {
        assert!(OutboundMessage::from_record(&record("", Value::Null)).is_none());
        assert!(OutboundMessage::from_record(&record("", json!(""))).is_none());
        assert!(OutboundMessage::from_record(&record("heartbeat", Value::Null)).is_some());
    }

    #[test]
    fn status_counts_are_integers() {
        let status = StatusResponse {
            subscribers: 12,
            stream: "f1:live:timing".into(),
            status: "running".into(),
            connector: "streaming".into(),
        };
        let text = serde_json::to_string(&status).unwrap();
        assert!(text.contains("\"subscribers\":12"));
    }
}
