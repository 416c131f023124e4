//! # SSE Framing
//!
//! Incremental decoder for `text/event-stream` bodies. Bytes arrive in
//! arbitrary chunks; complete lines are interpreted as they appear and a
//! blank line flushes the pending frame.

use bytes::BytesMut;
use thiserror::Error;

use crate::broker::StreamEvent;

/// Framing failures. Any of them ends the current upstream connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SseError {
    /// A single line grew past the configured limit.
    #[error("sse line exceeds {limit} bytes")]
    LineTooLong {
        /// Configured maximum line length.
        limit: usize,
    },
}

/// One flushed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// Value of the last `event:` line, empty if there was none.
    pub event: String,
    /// `data:` lines joined with `\n`.
    pub data: String,
}

impl StreamEvent {
    /// Stamps a decoded frame with its ingestion time, keeping JSON data
    /// structured and anything else as an opaque string.
    pub fn from_frame(frame: SseFrame, now_ms: i64) -> Self {
        StreamEvent::from_raw(frame.event, &frame.data, now_ms)
    }
}

/// Line-oriented SSE decoder.
#[derive(Debug)]
pub struct SseDecoder {
    buf: BytesMut,
    event: String,
    data: String,
    max_line: usize,
}

impl SseDecoder {
    /// Creates a decoder that rejects lines longer than `max_line` bytes.
    pub fn new(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            event: String::new(),
            data: String::new(),
            max_line,
        }
    }

    /// Consumes one chunk and returns every frame it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<SseFrame>, SseError> {
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            if pos > self.max_line {
                return Err(SseError::LineTooLong { limit: self.max_line });
            }
            let line = self.buf.split_to(pos + 1);
            let text = String::from_utf8_lossy(&line[..pos]);
            if let Some(frame) = self.line(text.trim()) {
                frames.push(frame);
            }
        }

        if self.buf.len() > self.max_line {
            return Err(SseError::LineTooLong { limit: self.max_line });
        }
        Ok(frames)
    }

    fn line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let event = std::mem::take(&mut self.event);
            let data = std::mem::take(&mut self.data);
            return (!data.is_empty()).then_some(SseFrame { event, data });
        }
        if line.starts_with(':') {
            return None;
        }
        if let Some(value) = line.strip_prefix("event:") {
            self.event = value.trim().to_string();
        } else if let Some(value) = line.strip_prefix("data:") {
            if !self.data.is_empty() {
                self.data.push('\n');
            }
            self.data.push_str(value.trim());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_all(chunks: &[&[u8]]) -> Vec<SseFrame> {
        let mut decoder = SseDecoder::new(1024);
        chunks
            .iter()
            .flat_map(|chunk| decoder.feed(chunk).unwrap())
            .collect()
    }

    #[test]
    fn named_json_frame() {
        let frames = decode_all(&[b"event: foo\ndata: {\"a\":1}\n\n"]);
        assert_eq!(
            frames,
            vec![SseFrame {
                event: "foo".into(),
                data: r#"{"a":1}"#.into()
            }]
        );
        let event = StreamEvent::from_frame(frames[0].clone(), 7);
        assert_eq!(event.payload, json!({"a": 1}));
        assert_eq!(event.ingestion_time_ms, 7);
    }

    #[test]
    fn unnamed_opaque_frame() {
        let frames = decode_all(&[b"data: not-json\n\n"]);
        let event = StreamEvent::from_frame(frames[0].clone(), 0);
        assert_eq!(event.event_name, "");
        assert_eq!(event.payload, json!("not-json"));
    }

    #[test]
    fn chunk_boundaries_anywhere() {
        let frames = decode_all(&[b"ev", b"ent: lap\r", b"\ndata: {\"driver\":\"P\xC3", b"\xA9rez\"}\n", b"\r\n"]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, "lap");
        assert_eq!(frames[0].data, "{\"driver\":\"Pérez\"}");
    }

    #[test]
    fn multi_line_data_is_newline_joined() {
        let frames = decode_all(&[b"data: first\ndata: second\n\n"]);
        assert_eq!(frames[0].data, "first\nsecond");
    }

    #[test]
    fn comments_ids_and_empty_frames_are_ignored() {
        let frames = decode_all(&[
            b": keep-alive\n\n",
            b"event: orphan\n\n",
            b"id: 9\nretry: 100\ndata: x\n\n",
        ]);
        assert_eq!(
            frames,
            vec![SseFrame {
                event: String::new(),
                data: "x".into()
            }]
        );
    }

    #[test]
    fn overlong_lines_are_rejected() {
        let mut decoder = SseDecoder::new(8);
        assert_eq!(
            decoder.feed(b"data: 0123456789"),
            Err(SseError::LineTooLong { limit: 8 })
        );
        let mut decoder = SseDecoder::new(8);
        assert_eq!(
            decoder.feed(b"data: 0123456789\n"),
            Err(SseError::LineTooLong { limit: 8 })
        );
    }

    #[test]
    fn partial_frame_is_held_until_terminated() {
        let mut decoder = SseDecoder::new(64);
        assert!(decoder.feed(b"data: {\"a\":").unwrap().is_empty());
        assert!(decoder.feed(b"1}\n").unwrap().is_empty());
        assert_eq!(decoder.feed(b"\n").unwrap().len(), 1);
    }
}
