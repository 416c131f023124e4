//! # Subscription Manager
//!
//! One mutex guards the subscriber counter and the handle of the running feed
//! task. Every transition (including awaiting the old task on 1 -> 0) happens
//! with that lock held, so a fast leave/join pair serializes as "stop fully,
//! then start fresh".

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Something the manager can switch on for as long as subscribers exist.
pub trait UpstreamFeed: Send + Sync {
    /// Starts one activation and returns its task. The task must exit
    /// promptly once `token` is cancelled.
    fn activate(&self, token: CancellationToken) -> JoinHandle<()>;
}

struct Activation {
    token: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct State {
    count: usize,
    active: Option<Activation>,
    closed: bool,
}

/// Reference-counted owner of the upstream feed activation.
pub struct SubscriptionManager {
    feed: Arc<dyn UpstreamFeed>,
    root: CancellationToken,
    state: Mutex<State>,
}

impl SubscriptionManager {
    /// Creates a manager with no subscribers and an idle feed.
    pub fn new(feed: Arc<dyn UpstreamFeed>) -> Self {
        Self {
            feed,
            root: CancellationToken::new(),
            state: Mutex::new(State::default()),
        }
    }

    /// Registers one subscriber and returns the new count. On the 0 -> 1
    /// transition the feed is activated before this returns.
    pub async fn add_subscriber(&self) -> usize {
        let mut state = self.state.lock().await;
        state.count += 1;

        if state.count == 1 && state.active.is_none() {
            if state.closed {
                tracing::debug!("subscriber joined during shutdown, feed stays off");
            } else {
                let token = self.root.child_token();
                let task = self.feed.activate(token.clone());
                state.active = Some(Activation { token, task });
                tracing::info!(subscribers = state.count, "first subscriber, upstream feed activated");
            }
        } else {
            tracing::debug!(subscribers = state.count, "subscriber added");
        }
        state.count
    }

    /// Unregisters one subscriber and returns the new count. On the 1 -> 0
    /// transition the feed is cancelled and its task awaited before this
    /// returns. Removing with no subscribers is a logged no-op.
    pub async fn remove_subscriber(&self) -> usize {
        let mut state = self.state.lock().await;
        if state.count == 0 {
            tracing::warn!("remove_subscriber called with no subscribers");
            return 0;
        }
        state.count -= 1;

        if state.count == 0 {
            if let Some(activation) = state.active.take() {
                stop(activation).await;
                tracing::info!("last subscriber left, upstream feed deactivated");
            }
        } else {
            tracing::debug!(subscribers = state.count, "subscriber removed");
        }
        state.count
    }

    /// Current number of subscribers.
    pub async fn count(&self) -> usize {
        self.state.lock().await.count
    }

    /// Whether a feed activation currently exists.
    pub async fn is_feed_active(&self) -> bool {
        self.state.lock().await.active.is_some()
    }

    /// Stops the feed unconditionally and refuses further activations.
    /// Safe to call more than once.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if !state.closed {
            state.closed = true;
            self.root.cancel();
        }
        if let Some(activation) = state.active.take() {
            stop(activation).await;
            tracing::info!(subscribers = state.count, "subscription manager closed, upstream feed stopped");
        }
    }
}

async fn stop(activation: Activation) {
    activation.token.cancel();
    if let Err(e) = activation.task.await {
        if e.is_panic() {
            tracing::error!("upstream feed task panicked: {e}");
        }
    }
}
