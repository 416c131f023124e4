use crate::live_logic::model::{HealthResponse, StatusResponse};
use crate::live_logic::session;
use crate::live_logic::state::AppState;
use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws/live", get(ws_handler))
        .route("/ws/status", get(status_handler))
        .route("/health", get(health_handler))
        // Any origin may connect; there is no auth on this surface.
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serves until the state's shutdown token is cancelled.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr()?;
    tracing::info!(%addr, stream_key = %state.stream_key(), "downstream server listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.cancelled().await;
        tracing::info!("downstream server shutting down");
    })
    .await?;
    Ok(())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(client): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    // Counted from the upgrade request on, so shutdown also waits for
    // sessions whose handshake is still completing.
    let tracked = state.sessions.token();
    ws.on_upgrade(move |socket| async move {
        session::run_session(socket, client, state).await;
        drop(tracked);
    })
}

/// Closes the session tracker and waits up to `grace` for running sessions to
/// send their close frames. Returns how many were still open at the deadline.
pub async fn drain_sessions(state: &AppState, grace: Duration) -> usize {
    state.sessions.close();
    match tokio::time::timeout(grace, state.sessions.wait()).await {
        Ok(()) => 0,
        Err(_) => state.sessions.len(),
    }
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        subscribers: state.subscriptions.count().await,
        stream: state.stream_key().to_string(),
        status: "running".to_string(),
        connector: state.connector_state().as_str().to_string(),
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse::default())
}
