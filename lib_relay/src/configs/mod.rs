//! # Configs Module
//!
//! Relay policy: every interval, retry budget and retention bound the core
//! uses. Nothing in the core hard-codes these values; binaries build a
//! [`RelayConfig`] (usually from defaults, a JSON file and the environment)
//! and hand the sections to the components that need them.

/// Relay configuration sections and validation.
pub mod relay_config;

pub use relay_config::{BrokerConfig, ConfigError, FeedConfig, RelayConfig, SessionConfig};
