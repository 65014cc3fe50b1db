//! Read-only HTTP debug surface.
//!
//! - `GET /debug/streams`: snapshots of every in-flight stream
//! - `GET /debug/stats`: gateway counters and buffer pool usage

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use tokio::net::TcpListener;
use tracing::info;

use crate::proxy::dispatch::{Gateway, GatewayStatsSnapshot};
use crate::proxy::stream::StreamSnapshot;

pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/debug/streams", get(streams))
        .route("/debug/stats", get(stats))
        .with_state(gateway)
}

async fn streams(State(gateway): State<Arc<Gateway>>) -> Json<Vec<StreamSnapshot>> {
    Json(gateway.active_streams())
}

async fn stats(State(gateway): State<Arc<Gateway>>) -> Json<GatewayStatsSnapshot> {
    Json(gateway.stats())
}

/// Serve the debug surface on an already bound listener until gateway
/// shutdown.
pub async fn serve(listener: TcpListener, gateway: Arc<Gateway>) -> std::io::Result<()> {
    let mut shutdown = gateway.shutdown_signal();
    info!(addr = ?listener.local_addr().ok(), "Debug server listening");
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
}

/// Bind `addr` and serve.
pub async fn bind_and_serve(addr: SocketAddr, gateway: Arc<Gateway>) -> std::io::Result<()> {
    serve(TcpListener::bind(addr).await?, gateway).await
}
