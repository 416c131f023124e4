//! # Relay Config
//!
//! Policy sections for the connector, the broker and the fan-out sessions.
//! Every wait is stored as a `*_ms` integer and read back through a
//! [`Duration`] accessor; [`RelayConfig::validate`] rejects values that would
//! turn a bounded wait into a busy loop.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default upstream feed of the live timing deployment.
pub const DEFAULT_FEED_URL: &str = "https://rt-api.f1-dash.com/api/realtime";
/// Default broker stream key.
pub const DEFAULT_STREAM_KEY: &str = "f1:live:timing";

/// Rejected configuration values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// A required string was empty.
    #[error("{0} must not be empty")]
    Empty(&'static str),
    /// A count or duration was zero where at least one is required.
    #[error("{0} must be at least 1")]
    Zero(&'static str),
    /// The idle window would expire before the first heartbeat.
    #[error("idleTimeoutMs ({idle_ms}) must be greater than heartbeatIntervalMs ({heartbeat_ms})")]
    IdleNotAfterHeartbeat {
        /// Configured idle timeout.
        idle_ms: u64,
        /// Configured heartbeat interval.
        heartbeat_ms: u64,
    },
}

/// # Relay Config
///
/// Top-level policy for one relay instance. Serialized in camelCase with
/// every field defaulted, so a partial JSON document is always valid input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Upstream SSE connector settings.
    pub feed: FeedConfig,
    /// Broker key and retention.
    pub broker: BrokerConfig,
    /// Per-client session timings and budgets.
    pub session: SessionConfig,
}

impl RelayConfig {
    /// Checks cross-field constraints. Call once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.feed.validate()?;
        self.broker.validate()?;
        self.session.validate()
    }
}

/// Upstream feed connector policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedConfig {
    /// SSE endpoint.
    pub url: String,
    /// Fixed wait before reconnecting after a transient failure.
    pub reconnect_delay_ms: u64,
    /// TCP/TLS connect timeout. The body itself has no read timeout.
    pub connect_timeout_ms: u64,
    /// Attempts per record before it is dropped.
    pub append_attempts: u32,
    /// Linear backoff unit between append attempts.
    pub append_backoff_ms: u64,
    /// Longest accepted SSE line.
    pub max_line_bytes: usize,
    /// Skip TLS certificate verification. Never on by default.
    pub insecure_tls: bool,
    /// `User-Agent` sent upstream.
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_FEED_URL.to_string(),
            reconnect_delay_ms: 10_000,
            connect_timeout_ms: 10_000,
            append_attempts: 3,
            append_backoff_ms: 1_000,
            max_line_bytes: 256 * 1024,
            insecure_tls: false,
            user_agent: concat!("lib_relay/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FeedConfig {
    /// Reconnect backoff as a [`Duration`].
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Wait before retry number `attempt` (1-based): `append_backoff * attempt`.
    pub fn append_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.append_backoff_ms.saturating_mul(u64::from(attempt)))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::Empty("feed.url"));
        }
        if self.reconnect_delay_ms == 0 {
            return Err(ConfigError::Zero("feed.reconnectDelayMs"));
        }
        if self.append_attempts == 0 {
            return Err(ConfigError::Zero("feed.appendAttempts"));
        }
        if self.max_line_bytes == 0 {
            return Err(ConfigError::Zero("feed.maxLineBytes"));
        }
        Ok(())
    }
}

/// Broker stream identity and retention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BrokerConfig {
    /// Stream key the connector writes and sessions read.
    pub stream_key: String,
    /// Approximate retention bound.
    pub max_len: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            stream_key: DEFAULT_STREAM_KEY.to_string(),
            max_len: 10_000,
        }
    }
}

impl BrokerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_key.trim().is_empty() {
            return Err(ConfigError::Empty("broker.streamKey"));
        }
        if self.max_len == 0 {
            return Err(ConfigError::Zero("broker.maxLen"));
        }
        Ok(())
    }
}

/// Fan-out session policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    /// Interval between server pings.
    pub heartbeat_interval_ms: u64,
    /// Silence after which a client is dropped.
    pub idle_timeout_ms: u64,
    /// Deadline for a single outbound frame.
    pub write_timeout_ms: u64,
    /// Records per broker read.
    pub read_batch: usize,
    /// Server-side wait of one blocking broker read.
    pub read_block_ms: u64,
    /// Consecutive broker read errors tolerated before the session ends.
    pub read_error_budget: u32,
    /// Pause after a failed broker read.
    pub read_retry_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            idle_timeout_ms: 60_000,
            write_timeout_ms: 10_000,
            read_batch: 100,
            read_block_ms: 2_000,
            read_error_budget: 5,
            read_retry_delay_ms: 1_000,
        }
    }
}

impl SessionConfig {
    /// Heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Write deadline as a [`Duration`].
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Blocking read wait as a [`Duration`].
    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read_block_ms)
    }

    /// Read retry pause as a [`Duration`].
    pub fn read_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read_retry_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Zero("session.heartbeatIntervalMs"));
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Zero("session.writeTimeoutMs"));
        }
        if self.read_batch == 0 {
            return Err(ConfigError::Zero("session.readBatch"));
        }
        if self.read_block_ms == 0 {
            return Err(ConfigError::Zero("session.readBlockMs"));
        }
        if self.read_error_budget == 0 {
            return Err(ConfigError::Zero("session.readErrorBudget"));
        }
        if self.idle_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::IdleNotAfterHeartbeat {
                idle_ms: self.idle_timeout_ms,
                heartbeat_ms: self.heartbeat_interval_ms,
            });
        }
        Ok(())
    }
}
