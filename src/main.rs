//! Process entry point: start the broadcast loop on a dedicated thread,
//! bring up the signaling HTTP server, and coordinate graceful shutdown
//! between the two (spec.md §5, §9).
//!
//! Grounded on `crates/server/src/main.rs`'s tracing-init / bind / serve /
//! SIGTERM shape, narrowed to a single process with no TLS layer and no
//! session manager — this process has exactly one broadcast loop instead of
//! per-session agents.

mod broadcast;
mod capture;
mod config;
mod metrics;
mod opus_codec;
mod peer;
mod signaling;
mod webrtc_peer;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use broadcast::LoopEvent;
use capture::PulseCapture;
use config::Config;
use metrics::Metrics;
use signaling::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env_and_args();
    let metrics = Arc::new(Metrics::new());

    let (handoff_tx, handoff_rx) = std::sync::mpsc::channel::<LoopEvent>();

    let capture = PulseCapture::open(config.capture_device.clone());
    let broadcast_thread = std::thread::Builder::new()
        .name("broadcast-loop".to_string())
        .spawn(move || broadcast::run(Box::new(capture), handoff_rx))
        .context("failed to spawn broadcast loop thread")?;

    let state = Arc::new(AppState {
        handoff_tx: handoff_tx.clone(),
        metrics,
    });
    let app = signaling::build_router(state);

    let bind_addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {bind_addr}"))?;

    tracing::info!("opuscaster listening on http://{bind_addr}");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("received SIGINT, shutting down");
                }
                _ = sigterm.recv() => {
                    tracing::info!("received SIGTERM, shutting down");
                }
            }
        })
        .await
        .context("server error")?;

    // Tell the broadcast loop to wind down and give it a bounded grace
    // period to flush final stats before we exit regardless (spec.md §5).
    let _ = handoff_tx.send(LoopEvent::Shutdown);
    let join = tokio::task::spawn_blocking(move || {
        let _ = broadcast_thread.join();
    });
    if tokio::time::timeout(config::SHUTDOWN_GRACE, join).await.is_err() {
        tracing::warn!("broadcast loop did not exit within the shutdown grace period");
    }

    Ok(())
}
