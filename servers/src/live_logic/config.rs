use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use lib_relay::configs::{BrokerConfig, FeedConfig, RelayConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_FILE: &str = "server_live.conf";

/// Which broker implementation backs the relay.
#[derive(ValueEnum, Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Redis Streams, shared across processes.
    Redis,
    /// In-process ring buffer, single instance only.
    Memory,
}

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Live timing relay: SSE feed to Redis Streams to WebSocket clients", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "LIVE_HOST", help = "Address to bind the HTTP/WebSocket server to.")]
    pub host: Option<String>,

    #[clap(long, env = "LIVE_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "LIVE_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "LIVE_LOG_LEVEL", help = "Logging level or filter directive (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "LIVE_LOG_JSON", help = "Write the log file as JSON lines.")]
    pub log_json: Option<bool>,

    #[clap(long, env = "LIVE_BROKER", value_enum, help = "Broker backend.")]
    pub broker: Option<BrokerKind>,

    #[clap(long, env = "LIVE_REDIS_URL", help = "Redis connection URL.")]
    pub redis_url: Option<String>,

    #[clap(long, env = "LIVE_FEED_URL", help = "Upstream SSE endpoint.")]
    pub feed_url: Option<String>,

    #[clap(long, env = "LIVE_STREAM_KEY", help = "Broker stream key.")]
    pub stream_key: Option<String>,

    #[clap(long, env = "LIVE_MAX_LEN", help = "Approximate number of records retained in the stream.")]
    pub max_len: Option<usize>,

    #[clap(long, env = "LIVE_RECONNECT_DELAY_MS", help = "Delay in milliseconds before reconnecting to the upstream feed.")]
    pub reconnect_delay_ms: Option<u64>,

    #[clap(long, env = "LIVE_CONNECT_TIMEOUT_MS", help = "Upstream connect timeout in milliseconds.")]
    pub connect_timeout_ms: Option<u64>,

    #[clap(long, env = "LIVE_APPEND_ATTEMPTS", help = "Broker append attempts per record before it is dropped.")]
    pub append_attempts: Option<u32>,

    #[clap(long, env = "LIVE_APPEND_BACKOFF_MS", help = "Linear backoff unit in milliseconds between append attempts.")]
    pub append_backoff_ms: Option<u64>,

    #[clap(long, env = "LIVE_INSECURE_TLS", help = "Accept invalid upstream TLS certificates.")]
    pub insecure_tls: Option<bool>,

    #[clap(long, env = "LIVE_HEARTBEAT_INTERVAL_MS", help = "Interval in milliseconds between pings to clients.")]
    pub heartbeat_interval_ms: Option<u64>,

    #[clap(long, env = "LIVE_IDLE_TIMEOUT_MS", help = "Milliseconds of client silence before the session is closed.")]
    pub idle_timeout_ms: Option<u64>,

    #[clap(long, env = "LIVE_WRITE_TIMEOUT_MS", help = "Deadline in milliseconds for one outbound frame.")]
    pub write_timeout_ms: Option<u64>,

    #[clap(long, env = "LIVE_READ_BATCH", help = "Records fetched per broker read.")]
    pub read_batch: Option<usize>,

    #[clap(long, env = "LIVE_READ_BLOCK_MS", help = "Blocking broker read wait in milliseconds.")]
    pub read_block_ms: Option<u64>,

    #[clap(long, env = "LIVE_READ_ERROR_BUDGET", help = "Consecutive broker read errors before a session is closed.")]
    pub read_error_budget: Option<u32>,

    #[clap(long, env = "LIVE_READ_RETRY_DELAY_MS", help = "Pause in milliseconds after a failed broker read.")]
    pub read_retry_delay_ms: Option<u64>,

    #[clap(long, env = "LIVE_SHUTDOWN_GRACE_MS", help = "Milliseconds granted to drain connections on shutdown.")]
    pub shutdown_grace_ms: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            host: other.host.or(self.host),
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            log_json: other.log_json.or(self.log_json),
            broker: other.broker.or(self.broker),
            redis_url: other.redis_url.or(self.redis_url),
            feed_url: other.feed_url.or(self.feed_url),
            stream_key: other.stream_key.or(self.stream_key),
            max_len: other.max_len.or(self.max_len),
            reconnect_delay_ms: other.reconnect_delay_ms.or(self.reconnect_delay_ms),
            connect_timeout_ms: other.connect_timeout_ms.or(self.connect_timeout_ms),
            append_attempts: other.append_attempts.or(self.append_attempts),
            append_backoff_ms: other.append_backoff_ms.or(self.append_backoff_ms),
            insecure_tls: other.insecure_tls.or(self.insecure_tls),
            heartbeat_interval_ms: other.heartbeat_interval_ms.or(self.heartbeat_interval_ms),
            idle_timeout_ms: other.idle_timeout_ms.or(self.idle_timeout_ms),
            write_timeout_ms: other.write_timeout_ms.or(self.write_timeout_ms),
            read_batch: other.read_batch.or(self.read_batch),
            read_block_ms: other.read_block_ms.or(self.read_block_ms),
            read_error_budget: other.read_error_budget.or(self.read_error_budget),
            read_retry_delay_ms: other.read_retry_delay_ms.or(self.read_retry_delay_ms),
            shutdown_grace_ms: other.shutdown_grace_ms.or(self.shutdown_grace_ms),
        }
    }

    /// Relay policy with every unset field left at the library default.
    pub fn relay_config(&self) -> RelayConfig {
        let feed = FeedConfig::default();
        let broker = BrokerConfig::default();
        let session = SessionConfig::default();

        RelayConfig {
            feed: FeedConfig {
                url: self.feed_url.clone().unwrap_or(feed.url),
                reconnect_delay_ms: self.reconnect_delay_ms.unwrap_or(feed.reconnect_delay_ms),
                connect_timeout_ms: self.connect_timeout_ms.unwrap_or(feed.connect_timeout_ms),
                append_attempts: self.append_attempts.unwrap_or(feed.append_attempts),
                append_backoff_ms: self.append_backoff_ms.unwrap_or(feed.append_backoff_ms),
                insecure_tls: self.insecure_tls.unwrap_or(feed.insecure_tls),
                ..feed
            },
            broker: BrokerConfig {
                stream_key: self.stream_key.clone().unwrap_or(broker.stream_key),
                max_len: self.max_len.unwrap_or(broker.max_len),
            },
            session: SessionConfig {
                heartbeat_interval_ms: self.heartbeat_interval_ms.unwrap_or(session.heartbeat_interval_ms),
                idle_timeout_ms: self.idle_timeout_ms.unwrap_or(session.idle_timeout_ms),
                write_timeout_ms: self.write_timeout_ms.unwrap_or(session.write_timeout_ms),
                read_batch: self.read_batch.unwrap_or(session.read_batch),
                read_block_ms: self.read_block_ms.unwrap_or(session.read_block_ms),
                read_error_budget: self.read_error_budget.unwrap_or(session.read_error_budget),
                read_retry_delay_ms: self.read_retry_delay_ms.unwrap_or(session.read_retry_delay_ms),
            },
        }
    }

    pub fn bind_addr(&self) -> String {
        format!(
            "{}:{}",
            self.host.as_deref().unwrap_or("0.0.0.0"),
            self.port.unwrap_or(8081)
        )
    }
}

fn defaults() -> Config {
    Config {
        host: Some("0.0.0.0".to_string()),
        port: Some(8081),
        log_dir: Some(PathBuf::from("./logs")),
        log_level: Some("info".to_string()),
        log_json: Some(true),
        broker: Some(BrokerKind::Redis),
        redis_url: Some("redis://127.0.0.1:6379/".to_string()),
        shutdown_grace_ms: Some(10_000),
        ..Default::default()
    }
}

/// Defaults, then the JSON file, then environment variables and CLI flags.
pub fn load_config() -> Result<Config> {
    // A missing .env is the normal case in production.
    let _ = dotenvy::dotenv();
    load_config_from(Config::parse())
}

pub fn load_config_from(cli: Config) -> Result<Config> {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = defaults();

    if config_file_path.exists() {
        let config_str = fs::read_to_string(&config_file_path)
            .with_context(|| format!("failed to read config file {}", config_file_path.display()))?;
        let file_config = serde_json::from_str::<Config>(&config_str)
            .with_context(|| format!("failed to parse config file {}", config_file_path.display()))?;
        current_config = current_config.merge(file_config);
    } else if cli.config_path.is_some() {
        anyhow::bail!("config file {} does not exist", config_file_path.display());
    }

    current_config = current_config.merge(cli);
    current_config.config_path = Some(config_file_path);

    current_config
        .relay_config()
        .validate()
        .context("invalid relay configuration")?;

    Ok(current_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn cli_with_file(path: PathBuf) -> Config {
        Config {
            config_path: Some(path),
            ..Default::default()
        }
    }

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"port": 9100, "streamKey": "f1:test", "broker": "memory", "readBlockMs": 500}}"#
        )
        .unwrap();

        let cli = Config {
            port: Some(9200),
            ..cli_with_file(file.path().to_path_buf())
        };
        let config = load_config_from(cli).unwrap();

        assert_eq!(config.port, Some(9200));
        assert_eq!(config.broker, Some(BrokerKind::Memory));
        assert_eq!(config.log_level.as_deref(), Some("info"));

        let relay = config.relay_config();
        assert_eq!(relay.broker.stream_key, "f1:test");
        assert_eq!(relay.session.read_block_ms, 500);
        assert_eq!(relay.feed.append_attempts, 3);
    }

    #[test]
    fn defaults_match_the_production_deployment() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default().merge(defaults());
        assert_eq!(config.bind_addr(), "0.0.0.0:8081");

        let relay = load_config_from(cli_with_file(dir.path().join("absent.conf")));
        assert!(relay.is_err(), "an explicit missing file is an error");

        let relay = config.relay_config();
        assert_eq!(relay.broker.stream_key, "f1:live:timing");
        assert_eq!(relay.broker.max_len, 10_000);
        assert_eq!(relay.feed.url, "https://rt-api.f1-dash.com/api/realtime");
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"heartbeatIntervalMs": 60000, "idleTimeoutMs": 30000}}"#).unwrap();
        assert!(load_config_from(cli_with_file(file.path().to_path_buf())).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(load_config_from(cli_with_file(file.path().to_path_buf())).is_err());
    }
}
