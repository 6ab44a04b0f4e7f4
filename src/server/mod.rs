//! HTTP surfaces of both roles.
//!
//! The scheduler serves completion reports, the fetcher serves task intake.
//! Both answer every request with a [`envelope::JsonResult`] body and HTTP 200.

pub mod envelope;
pub mod fetcher;
pub mod scheduler;

use std::net::SocketAddr;
use anyhow::{Context, Result};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Serve `app` on `addr` until `shutdown` is cancelled
pub async fn serve(addr: &str, app: Router, shutdown: CancellationToken) -> Result<()> {
    let addr: SocketAddr = addr.parse()
        .context(format!("Invalid listen address: {}", addr))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind {}", addr))?;

    info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("HTTP server failed")?;

    info!("HTTP server on {} stopped", addr);

    Ok(())
}
