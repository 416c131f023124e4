//! # Ingestors Module
//!
//! The "front door" of the relay: clients that pull data from an upstream
//! source and write it into the broker.
//!
//! ## Contained Modules:
//! - **`sse`**: incremental `text/event-stream` decoder.
//! - **`sse_feed`**: the reconnecting upstream connector, activated on demand
//!   by the subscription manager.

/// Incremental SSE line decoder.
pub mod sse;
/// Reconnecting SSE connector that appends into the broker.
pub mod sse_feed;

pub use sse::{SseDecoder, SseError, SseFrame};
pub use sse_feed::{ConnectorState, FeedError, SseFeedConnector};
