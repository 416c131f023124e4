//! Fan-out session: one per WebSocket client.
//!
//! A session pins its broker cursor, registers as a subscriber, then runs a
//! liveness loop and a relay loop under one cancellation scope. Whichever loop
//! stops first cancels the scope; the session then joins both, unregisters
//! exactly once and closes the socket.

use crate::live_logic::model::OutboundMessage;
use crate::live_logic::state::AppState;
use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes, WebSocket, close_code};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use lib_relay::broker::{BrokerError, BrokerReader, Cursor};
use lib_relay::configs::SessionConfig;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Write half of one client socket, shared by that session's two loops only.
pub type SharedSink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Session states. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionPhase {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    StreamEnded,
    ReadError,
    IdleTimeout,
    PingFailed,
    WriteFailed,
    WriteTimeout,
    BrokerReadFailed,
    Shutdown,
    TaskFailed,
}

impl CloseReason {
    fn close_code(self) -> u16 {
        match self {
            CloseReason::Shutdown => close_code::AWAY,
            CloseReason::BrokerReadFailed | CloseReason::TaskFailed => close_code::ERROR,
            _ => close_code::NORMAL,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::ClientClosed => "client closed",
            CloseReason::StreamEnded => "client stream ended",
            CloseReason::ReadError => "client read error",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::PingFailed => "ping failed",
            CloseReason::WriteFailed => "write failed",
            CloseReason::WriteTimeout => "write timed out",
            CloseReason::BrokerReadFailed => "broker read failed",
            CloseReason::Shutdown => "server shutting down",
            CloseReason::TaskFailed => "session task failed",
        };
        f.write_str(text)
    }
}

struct Phase {
    client: SocketAddr,
    current: SessionPhase,
}

impl Phase {
    fn new(client: SocketAddr) -> Self {
        tracing::debug!(%client, phase = ?SessionPhase::Connecting, "session phase");
        Self {
            client,
            current: SessionPhase::Connecting,
        }
    }

    fn advance(&mut self, next: SessionPhase) {
        if next <= self.current {
            return;
        }
        tracing::debug!(client = %self.client, from = ?self.current, to = ?next, "session phase");
        self.current = next;
    }
}

async fn open_reader(state: &AppState) -> Result<(Box<dyn BrokerReader>, Cursor), BrokerError> {
    let mut reader = state.broker.reader().await?;
    let cursor = reader.pin_now(state.stream_key()).await?;
    Ok((reader, cursor))
}

/// Runs one client from upgrade to close.
pub async fn run_session(mut socket: WebSocket, client: SocketAddr, state: AppState) {
    let mut phase = Phase::new(client);

    // The cursor is fixed before registering so nothing appended after the
    // join can fall between "now" and the first read.
    let (reader, cursor) = match open_reader(&state).await {
        Ok(opened) => opened,
        Err(e) => {
            tracing::warn!(%client, error = %e, "broker unavailable, rejecting client");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::ERROR,
                    reason: Utf8Bytes::from_static("broker unavailable"),
                })))
                .await;
            phase.advance(SessionPhase::Closed);
            return;
        }
    };

    let (sink, stream) = socket.split();
    let sink: SharedSink = Arc::new(Mutex::new(sink));
    let subscribers = state.subscriptions.add_subscriber().await;
    phase.advance(SessionPhase::Active);
    tracing::info!(%client, subscribers, cursor = %cursor.as_stream_id(), "client connected");

    let cfg = state.config.session.clone();
    let scope = state.shutdown.child_token();
    let liveness = tokio::spawn(liveness_loop(
        stream,
        Arc::clone(&sink),
        scope.clone(),
        cfg.clone(),
        client,
    ));
    let relay = tokio::spawn(relay_loop(
        reader,
        cursor,
        Arc::clone(&sink),
        scope.clone(),
        cfg.clone(),
        state.stream_key().to_string(),
        client,
    ));

    scope.cancelled().await;
    phase.advance(SessionPhase::Closing);

    let (liveness, relay) = tokio::join!(liveness, relay);
    let reason = match (liveness, relay) {
        (Ok(first), Ok(second)) => first.or(second).unwrap_or(CloseReason::Shutdown),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(%client, error = %e, "session task failed");
            CloseReason::TaskFailed
        }
    };

    let subscribers = state.subscriptions.remove_subscriber().await;

    let close = Message::Close(Some(CloseFrame {
        code: reason.close_code(),
        reason: Utf8Bytes::from(reason.to_string()),
    }));
    let _ = tokio::time::timeout(cfg.write_timeout(), async {
        let mut sink = sink.lock().await;
        let _ = sink.send(close).await;
        sink.close().await
    })
    .await;

    phase.advance(SessionPhase::Closed);
    tracing::info!(%client, %reason, subscribers, "client disconnected");
}

/// Pings on a fixed interval and watches inbound traffic. Returns `None`
/// when stopped by the shared scope.
async fn liveness_loop(
    mut stream: SplitStream<WebSocket>,
    sink: SharedSink,
    scope: CancellationToken,
    cfg: SessionConfig,
    client: SocketAddr,
) -> Option<CloseReason> {
    let _guard = scope.clone().drop_guard();

    let heartbeat = cfg.heartbeat_interval();
    let mut ping = tokio::time::interval_at(Instant::now() + heartbeat, heartbeat);
    ping.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let idle = tokio::time::sleep(cfg.idle_timeout());
    tokio::pin!(idle);

    loop {
        tokio::select! {
            _ = scope.cancelled() => return None,
            _ = &mut idle => {
                tracing::info!(%client, idle_ms = cfg.idle_timeout_ms, "client idle timeout");
                return Some(CloseReason::IdleTimeout);
            }
            _ = ping.tick() => {
                let sent = tokio::time::timeout(cfg.write_timeout(), async {
                    sink.lock().await.send(Message::Ping(Bytes::new())).await
                })
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    tracing::debug!(%client, "ping failed");
                    return Some(CloseReason::PingFailed);
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Close(_))) => return Some(CloseReason::ClientClosed),
                Some(Ok(_)) => idle.as_mut().reset(Instant::now() + cfg.idle_timeout()),
                Some(Err(e)) => {
                    tracing::debug!(%client, error = %e, "client read error");
                    return Some(CloseReason::ReadError);
                }
                None => return Some(CloseReason::StreamEnded),
            },
        }
    }
}

/// Tails the broker from `cursor` and forwards every record in order.
async fn relay_loop(
    mut reader: Box<dyn BrokerReader>,
    mut cursor: Cursor,
    sink: SharedSink,
    scope: CancellationToken,
    cfg: SessionConfig,
    stream_key: String,
    client: SocketAddr,
) -> Option<CloseReason> {
    let _guard = scope.clone().drop_guard();
    let mut failures = 0u32;

    loop {
        let batch = tokio::select! {
            _ = scope.cancelled() => return None,
            batch = reader.read(&stream_key, &cursor, cfg.read_batch, cfg.read_block()) => batch,
        };

        let records = match batch {
            Ok(records) => {
                failures = 0;
                records
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(%client, attempt = failures, error = %e, "broker read failed");
                if failures >= cfg.read_error_budget {
                    tracing::error!(%client, attempts = failures, "broker read retries exhausted");
                    return Some(CloseReason::BrokerReadFailed);
                }
                tokio::select! {
                    _ = scope.cancelled() => return None,
                    _ = tokio::time::sleep(cfg.read_retry_delay()) => {}
                }
                continue;
            }
        };

        for record in records {
            if scope.is_cancelled() {
                return None;
            }
            if let Some(message) = OutboundMessage::from_record(&record) {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!(%client, message_id = %record.id, error = %e, "failed to encode message");
                        cursor.advance(record.id);
                        continue;
                    }
                };
                let sent = tokio::time::timeout(cfg.write_timeout(), async {
                    sink.lock().await.send(Message::Text(text.into())).await
                })
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::debug!(%client, error = %e, "client write failed");
                        return Some(CloseReason::WriteFailed);
                    }
                    Err(_) => {
                        tracing::info!(%client, timeout_ms = cfg.write_timeout_ms, "client write timed out");
                        return Some(CloseReason::WriteTimeout);
                    }
                }
            }
            cursor.advance(record.id);
        }
    }
}
