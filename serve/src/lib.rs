//! WebSocket API for the Trellis gateway.
//!
//! One endpoint (`/`) upgrades to a WebSocket carrying the JSON protocol of
//! [`protocol`]: run requests (optionally streamed), session resets, lane
//! stats, ping. Shutdown is graceful with a hard deadline.

mod app;
mod connection;
pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use trellis::Gateway;

pub use protocol::{ClientRequest, ServerResponse};

/// Serves the gateway API on `addr` until `shutdown` fires, then enforces
/// the hard deadline on open connections.
pub async fn serve(
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    shutdown: CancellationToken,
    deadline: Duration,
) -> std::io::Result<()> {
    let router = app::router(app::AppState {
        gateway: Arc::clone(&gateway),
    });
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "gateway websocket listening");

    let graceful = axum::serve(listener, router).with_graceful_shutdown({
        let shutdown = shutdown.clone();
        async move { shutdown.cancelled().await }
    });

    tokio::select! {
        result = graceful => result,
        _ = async {
            shutdown.cancelled().await;
            tokio::time::sleep(deadline).await;
        } => {
            tracing::warn!("shutdown deadline reached; dropping open connections");
            Ok(())
        }
    }
}

/// Binds an ephemeral port and serves; returns the bound address and the
/// server task. Test helper, also handy for embedding.
pub async fn serve_ephemeral(
    gateway: Arc<Gateway>,
    shutdown: CancellationToken,
) -> std::io::Result<(SocketAddr, tokio::task::JoinHandle<std::io::Result<()>>)> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    let addr = listener.local_addr()?;
    let router = app::router(app::AppState { gateway });
    let handle = tokio::spawn(async move {
        axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });
    Ok((addr, handle))
}
