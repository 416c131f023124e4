use lib_relay::broker::Broker;
use lib_relay::configs::RelayConfig;
use lib_relay::core::{SubscriptionManager, UpstreamFeed};
use lib_relay::ingestors::ConnectorState;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Everything a request handler or session needs, cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub broker: Arc<dyn Broker>,
    pub subscriptions: Arc<SubscriptionManager>,
    connector_state: watch::Receiver<ConnectorState>,
    /// Cancelled once on shutdown; every session scope is a child of it.
    pub shutdown: CancellationToken,
    /// Upgraded WebSocket sessions, which the HTTP server stops tracking.
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        broker: Arc<dyn Broker>,
        feed: Arc<dyn UpstreamFeed>,
        connector_state: watch::Receiver<ConnectorState>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config: Arc::new(config),
            broker,
            subscriptions: Arc::new(SubscriptionManager::new(feed)),
            connector_state,
            shutdown,
            sessions: TaskTracker::new(),
        }
    }

    pub fn stream_key(&self) -> &str {
        &self.config.broker.stream_key
    }

    pub fn connector_state(&self) -> ConnectorState {
        *self.connector_state.borrow()
    }
}
