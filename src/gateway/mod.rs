//! Axum-based relay server.
//!
//! Devices connect to `GET /sync` over WebSocket, JOIN a session, and the
//! relay forwards their frames to the other participants. Nothing is stored;
//! a session lives in [`SessionRegistry`] only while devices are connected
//! (and never longer than the session TTL).
//!
//! - `GET /sync`: WebSocket relay endpoint
//! - `GET /health`: liveness plus session counts

pub mod connection;

use crate::config::RelayConfig;
use crate::sync::registry::SessionRegistry;
use anyhow::{Context, Result};
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum plain-HTTP request body (WebSocket frames are capped separately).
pub const MAX_BODY_SIZE: usize = 65_536;
/// Plain-HTTP request timeout.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub config: Arc<RelayConfig>,
    pub started_at: std::time::Instant,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            config.session_ttl(),
            config.max_participants,
        ));
        Self {
            registry,
            config: Arc::new(config),
            started_at: std::time::Instant::now(),
        }
    }
}

/// Bind to the configured address and run until Ctrl-C.
pub async fn run_gateway(config: RelayConfig) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", config.host, config.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let actual = listener.local_addr()?;

    println!("🔁 pairsync relay listening on {actual}");
    println!("  WS   /sync      — device sync channel");
    println!("  GET  /health    — health check");
    println!("  Press Ctrl+C to stop.\n");

    serve(listener, AppState::new(config), shutdown_signal()).await
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let sweeper = spawn_sweeper(Arc::clone(&state.registry), state.config.sweep_interval());
    tracing::info!(
        addr = %listener.local_addr()?,
        session_ttl_secs = state.config.session_ttl_secs,
        sweep_interval_secs = state.config.sweep_interval_secs,
        "Relay started"
    );

    let app = build_router(state);
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;
    sweeper.abort();
    result?;
    tracing::info!("Relay stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route("/sync", get(handle_sync_ws))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Periodic session sweep.
fn spawn_sweeper(registry: Arc<SessionRegistry>, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let removed = registry.sweep();
            if removed > 0 {
                tracing::info!(removed, "Swept expired sessions");
            } else {
                tracing::debug!("Session sweep found nothing to evict");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

// ══════════════════════════════════════════════════════════════════════════════
// AXUM HANDLERS
// ══════════════════════════════════════════════════════════════════════════════

/// GET /health: always public (no session ids leaked)
async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    let stats = state.registry.stats();
    Json(serde_json::json!({
        "status": "ok",
        "sessions": stats.sessions,
        "participants": stats.participants,
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /sync: WebSocket upgrade for the device relay channel.
async fn handle_sync_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(state.config.max_message_bytes)
        .on_upgrade(move |socket| connection::run(socket, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_reports_session_counts() {
        let state = AppState::new(RelayConfig::default());
        let (tx, _rx) = tokio::sync::mpsc::channel(4);
        let _handle = state.registry.join("s1", "dev-a", tx).unwrap();

        let response = build_router(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["sessions"], 1);
        assert_eq!(parsed["participants"], 1);
    }

    #[tokio::test]
    async fn sync_route_requires_upgrade() {
        let state = AppState::new(RelayConfig::default());
        let response = build_router(state)
            .oneshot(Request::builder().uri("/sync").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_is_404() {
        let state = AppState::new(RelayConfig::default());
        let response = build_router(state)
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
