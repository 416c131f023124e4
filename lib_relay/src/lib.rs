//! # Live Relay Core
//!
//! Shared library behind the `server_live` gateway. It ingests one upstream
//! Server-Sent-Events feed, persists every frame into a bounded multi-reader
//! broker, and lets any number of WebSocket sessions tail that broker. The
//! upstream connection only exists while somebody is listening.
//!
//! Each area lives in its own folder and is gated by a cargo feature of the
//! same name (`full` enables everything):
//!
//! - **`broker`**: the append/read contract plus Redis Streams and in-process
//!   implementations.
//! - **`ingestors`**: SSE framing and the feed connector that writes into the
//!   broker.
//! - **`core`**: the subscription manager that owns the connector lifecycle.
//! - **`configs`**: relay policy (intervals, retry budgets, retention).

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

#[cfg(feature = "broker")]
pub mod broker;
#[cfg(feature = "configs")]
pub mod configs;
#[cfg(feature = "core")]
pub mod core;
#[cfg(feature = "ingestors")]
pub mod ingestors;
