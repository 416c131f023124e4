use anyhow::{Context, Result};
use lib_relay::broker::{Broker, MemoryBroker, RedisStreamBroker};
use lib_relay::ingestors::SseFeedConnector;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod live_logic;
use live_logic::config::BrokerKind;
use live_logic::{config, downstream, logger, state};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::load_config()?;
    let log_dir = config.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"));
    let log_level = config.log_level.as_deref().unwrap_or("info");
    let _log_guard = logger::setup_logging(&log_dir, log_level, config.log_json.unwrap_or(true))?;

    let relay = config.relay_config();
    tracing::info!(
        feed_url = %relay.feed.url,
        stream_key = %relay.broker.stream_key,
        max_len = relay.broker.max_len,
        broker = ?config.broker,
        "starting live relay"
    );

    let broker: Arc<dyn Broker> = match config.broker.unwrap_or(BrokerKind::Redis) {
        BrokerKind::Redis => {
            let url = config.redis_url.as_deref().unwrap_or("redis://127.0.0.1:6379/");
            let redis = RedisStreamBroker::connect(url)
                .await
                .with_context(|| format!("failed to connect to redis at {url}"))?;
            redis.ping().await.context("redis did not answer PING")?;
            tracing::info!(redis_url = url, "connected to redis");
            Arc::new(redis)
        }
        BrokerKind::Memory => {
            tracing::warn!("using the in-process broker, records are not shared between processes");
            Arc::new(MemoryBroker::new())
        }
    };

    let connector = SseFeedConnector::new(relay.feed.clone(), relay.broker.clone(), Arc::clone(&broker))
        .context("failed to build the feed connector")?;
    let connector_state = connector.subscribe_state();

    let shutdown = CancellationToken::new();
    let app_state = state::AppState::new(
        relay,
        broker,
        Arc::new(connector),
        connector_state,
        shutdown.clone(),
    );

    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    let mut server = tokio::spawn(downstream::serve(listener, app_state.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server => {
            shutdown.cancel();
            app_state.subscriptions.close().await;
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.context("downstream server failed")),
                Err(e) => Err(anyhow::Error::new(e).context("downstream server task failed")),
            };
        }
    }

    // Stop accepting, end every session, then stop the upstream feed.
    shutdown.cancel();
    app_state.subscriptions.close().await;

    let grace = Duration::from_millis(config.shutdown_grace_ms.unwrap_or(10_000));
    let deadline = tokio::time::Instant::now() + grace;
    match tokio::time::timeout_at(deadline, server).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "downstream server failed during shutdown"),
        Ok(Err(e)) => tracing::error!(error = %e, "downstream server task failed"),
        Err(_) => tracing::warn!(grace_ms = grace.as_millis() as u64, "shutdown grace period elapsed"),
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    let open = downstream::drain_sessions(&app_state, remaining).await;
    if open > 0 {
        tracing::warn!(sessions = open, "sessions still open after the grace period");
    }

    tracing::info!("Shutdown complete.");
    Ok(())
}

async fn shutdown_signal() {
    let terminate = async {
        #[cfg(unix)]
        {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut term_signal) => {
                    term_signal.recv().await;
                    tracing::info!("SIGTERM received, initiating shutdown.");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            // On non-unix platforms, just wait forever.
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
            tracing::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = terminate => {}
    }
}
