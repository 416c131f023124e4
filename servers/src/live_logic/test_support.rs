//! In-process server harness for session and endpoint tests.

use crate::live_logic::downstream;
use crate::live_logic::state::AppState;
use futures_util::StreamExt;
use lib_relay::broker::{Broker, MemoryBroker, StreamEvent};
use lib_relay::configs::{RelayConfig, SessionConfig};
use lib_relay::core::UpstreamFeed;
use lib_relay::ingestors::ConnectorState;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

pub const STREAM_KEY: &str = "test:live";

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Feed that only counts activations and waits for cancellation.
#[derive(Default)]
pub struct StubFeed {
    pub activations: AtomicUsize,
    pub running: Arc<AtomicUsize>,
}

impl UpstreamFeed for StubFeed {
    fn activate(&self, token: CancellationToken) -> JoinHandle<()> {
        self.activations.fetch_add(1, Ordering::SeqCst);
        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            token.cancelled().await;
            running.fetch_sub(1, Ordering::SeqCst);
        })
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
    pub feed: Arc<StubFeed>,
    pub connector_tx: watch::Sender<ConnectorState>,
}

/// Short timings so liveness behaviour shows up within a test.
pub fn fast_session() -> SessionConfig {
    SessionConfig {
        heartbeat_interval_ms: 50,
        idle_timeout_ms: 250,
        write_timeout_ms: 1_000,
        read_block_ms: 50,
        read_retry_delay_ms: 10,
        ..SessionConfig::default()
    }
}

pub async fn start(session: SessionConfig, broker: Arc<dyn Broker>) -> TestServer {
    let mut config = RelayConfig::default();
    config.broker.stream_key = STREAM_KEY.to_string();
    config.session = session;

    let feed = Arc::new(StubFeed::default());
    let (connector_tx, connector_rx) = watch::channel(ConnectorState::Idle);
    let state = AppState::new(
        config,
        broker,
        feed.clone(),
        connector_rx,
        CancellationToken::new(),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(downstream::serve(listener, state.clone()));

    TestServer {
        addr,
        state,
        feed,
        connector_tx,
    }
}

pub async fn start_with_memory(session: SessionConfig) -> (TestServer, MemoryBroker) {
    let broker = MemoryBroker::new();
    let server = start(session, Arc::new(broker.clone())).await;
    (server, broker)
}

pub fn event(name: &str, data: &str) -> StreamEvent {
    StreamEvent::from_raw(name, data, chrono::Utc::now().timestamp_millis())
}

impl TestServer {
    pub async fn connect(&self) -> WsClient {
        let url = format!("ws://{}/ws/live", self.addr);
        let (ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        ws
    }

    /// Polls the subscriber count until it equals `n` or panics after 3s.
    pub async fn wait_for_subscribers(&self, n: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            let count = self.state.subscriptions.count().await;
            if count == n {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "expected {n} subscribers, still {count}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Plain HTTP GET, returning the status code and JSON body.
    pub async fn get_json(&self, path: &str) -> (u16, serde_json::Value) {
        let mut socket = TcpStream::connect(self.addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n", self.addr);
        socket.write_all(request.as_bytes()).await.unwrap();
        let mut raw = Vec::new();
        socket.read_to_end(&mut raw).await.unwrap();

        let text = String::from_utf8(raw).unwrap();
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        let code = head.split_whitespace().nth(1).unwrap().parse().unwrap();
        (code, serde_json::from_str(body).unwrap())
    }
}

/// Next text frame, skipping control frames. Panics on close or timeout.
pub async fn next_text(ws: &mut WsClient) -> String {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("no frame within 3s")
            .expect("stream ended")
            .expect("read error");
        match frame {
            WsMessage::Text(text) => return text.to_string(),
            WsMessage::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => continue,
        }
    }
}

/// Reads until the server's close frame arrives and returns its code.
pub async fn close_code(ws: &mut WsClient) -> Option<u16> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("no close within 3s");
        match frame {
            Some(Ok(WsMessage::Close(frame))) => return frame.map(|f| u16::from(f.code)),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}
