//! # SSE Feed Connector
//!
//! Holds one long-lived streaming GET against the upstream SSE endpoint and
//! appends every decoded frame to the broker. Connection errors, non-2xx
//! answers and end-of-stream are all transient: the connector waits the
//! configured backoff and dials again until its token is cancelled.
//!
//! Broker writes are best effort. Each record gets a bounded number of
//! attempts with linear backoff, then it is dropped and logged; the upstream
//! read never stalls on a failing broker for longer than that budget.

use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::sse::{SseDecoder, SseError};
use crate::broker::{Broker, RecordId, StreamEvent};
use crate::configs::{BrokerConfig, FeedConfig};
use crate::core::UpstreamFeed;

/// Failures of one upstream connection attempt.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The HTTP client could not be constructed.
    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
    /// Connecting or reading the body failed.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
    /// The upstream answered with a non-success status.
    #[error("upstream answered with status {0}")]
    Status(StatusCode),
    /// The body violated SSE framing limits.
    #[error(transparent)]
    Sse(#[from] SseError),
}

/// Lifecycle of the connector as seen from outside.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    /// Not activated.
    Idle,
    /// Dialing the upstream.
    Connecting,
    /// Reading the event stream.
    Streaming,
    /// Waiting before the next connection attempt.
    Backoff,
}

impl ConnectorState {
    /// Lower-case name used in logs and status payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Idle => "idle",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Streaming => "streaming",
            ConnectorState::Backoff => "backoff",
        }
    }
}

/// Upstream SSE connector writing into a [`Broker`].
#[derive(Clone)]
pub struct SseFeedConnector {
    feed: Arc<FeedConfig>,
    target: Arc<BrokerConfig>,
    broker: Arc<dyn Broker>,
    client: reqwest::Client,
    state: Arc<watch::Sender<ConnectorState>>,
}

impl SseFeedConnector {
    /// Builds the connector and its HTTP client. The client has a connect
    /// timeout but no overall timeout, since the body is meant to stay open.
    pub fn new(
        feed: FeedConfig,
        target: BrokerConfig,
        broker: Arc<dyn Broker>,
    ) -> Result<Self, FeedError> {
        if feed.insecure_tls {
            tracing::warn!(url = %feed.url, "TLS certificate verification is disabled for the upstream feed");
        }
        let client = reqwest::Client::builder()
            .connect_timeout(feed.connect_timeout())
            .user_agent(feed.user_agent.clone())
            .danger_accept_invalid_certs(feed.insecure_tls)
            .build()
            .map_err(FeedError::Client)?;
        let (state, _) = watch::channel(ConnectorState::Idle);

        Ok(Self {
            feed: Arc::new(feed),
            target: Arc::new(target),
            broker,
            client,
            state: Arc::new(state),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectorState {
        *self.state.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: ConnectorState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(from = current.as_str(), to = next.as_str(), "connector state");
            *current = next;
            true
        });
    }

    /// One activation lifetime: connect, stream, back off, repeat, until
    /// `token` is cancelled. Returns promptly on cancellation from any wait.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(url = %self.feed.url, stream_key = %self.target.stream_key, "feed connector started");

        loop {
            self.set_state(ConnectorState::Connecting);
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                outcome = self.stream_once(&token) => outcome,
            };

            let delay = self.feed.reconnect_delay();
            match outcome {
                Ok(()) => tracing::warn!(
                    url = %self.feed.url,
                    delay_ms = self.feed.reconnect_delay_ms,
                    "upstream stream ended, reconnecting"
                ),
                Err(e) => tracing::warn!(
                    url = %self.feed.url,
                    delay_ms = self.feed.reconnect_delay_ms,
                    error = %e,
                    "upstream connection failed, reconnecting"
                ),
            }

            self.set_state(ConnectorState::Backoff);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(ConnectorState::Idle);
        tracing::info!(stream_key = %self.target.stream_key, "feed connector stopped");
    }

    async fn stream_once(&self, token: &CancellationToken) -> Result<(), FeedError> {
        let response = self
            .client
            .get(&self.feed.url)
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FeedError::Status(status));
        }

        self.set_state(ConnectorState::Streaming);
        tracing::info!(url = %self.feed.url, "connected to upstream feed");

        let mut decoder = SseDecoder::new(self.feed.max_line_bytes);
        let mut body = response.bytes_stream();
        while let Some(chunk) = body.next().await {
            for frame in decoder.feed(&chunk?)? {
                let event = StreamEvent::from_frame(frame, now_millis());
                if token.is_cancelled() {
                    return Ok(());
                }
                self.append_with_retry(&event, token).await;
            }
        }
        Ok(())
    }

    /// Appends with up to `append_attempts` tries. Returns the id on success,
    /// `None` when the record was dropped or the connector is shutting down.
    async fn append_with_retry(
        &self,
        event: &StreamEvent,
        token: &CancellationToken,
    ) -> Option<RecordId> {
        let attempts = self.feed.append_attempts.max(1);
        for attempt in 1..=attempts {
            match self
                .broker
                .append(&self.target.stream_key, event, self.target.max_len)
                .await
            {
                Ok(id) => {
                    tracing::trace!(event = %event.event_name, message_id = %id, "record appended");
                    return Some(id);
                }
                Err(e) => {
                    tracing::warn!(event = %event.event_name, attempt, error = %e, "broker append failed");
                    if attempt < attempts {
                        tokio::select! {
                            _ = token.cancelled() => return None,
                            _ = tokio::time::sleep(self.feed.append_backoff(attempt)) => {}
                        }
                    }
                }
            }
        }

        tracing::error!(event = %event.event_name, attempts, "broker append failed after retries, record dropped");
        None
    }
}

impl UpstreamFeed for SseFeedConnector {
    fn activate(&self, token: CancellationToken) -> JoinHandle<()> {
        let connector = self.clone();
        tokio::spawn(async move { connector.run(token).await })
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn connector(url: &str) -> SseFeedConnector {
        let feed = FeedConfig {
            url: url.to_string(),
            reconnect_delay_ms: 60_000,
            ..FeedConfig::default()
        };
        SseFeedConnector::new(feed, BrokerConfig::default(), Arc::new(MemoryBroker::new())).unwrap()
    }

    #[test]
    fn state_names() {
        assert_eq!(ConnectorState::Idle.as_str(), "idle");
        assert_eq!(ConnectorState::Backoff.as_str(), "backoff");
    }

    #[tokio::test]
    async fn unreachable_upstream_backs_off_and_stops_on_cancel() {
        // Port 9 (discard) on loopback is refused on test machines.
        let connector = connector("http://127.0.0.1:9/stream");
        let mut states = connector.subscribe_state();
        let token = CancellationToken::new();
        let task = connector.activate(token.clone());

        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            states.wait_for(|s| *s == ConnectorState::Backoff),
        )
        .await
        .unwrap()
        .unwrap();

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connector.state(), ConnectorState::Idle);
    }
}
