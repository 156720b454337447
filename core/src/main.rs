/// meshdash - mesh aggregation service: bridge client, ingest task and JSON API
use meshdash_core::ingest::{spawn_ingest, INGEST_QUEUE_CAPACITY};
use meshdash_core::mesh::bridge::bridge;
use meshdash_core::sink::TracingSink;
use meshdash_core::{api, Config, MeshState};
use std::env;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .init();

    let args: Vec<String> = env::args().collect();
    let config = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    info!("Starting meshdash");
    info!("   Bridge: {}", config.bridge_addr);
    info!("   API: http://{}", config.api_addr);
    info!(
        "   History: {} points / {}s, {} messages per conversation",
        config.history_maxlen, config.history_sample_secs, config.max_msgs_per_conv
    );

    let state = MeshState::new(&config).with_sink(Arc::new(TracingSink));

    let (events_tx, events_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
    let (transport, handle) = bridge(&config, events_tx);
    state.attach_transport(Arc::new(handle));

    let ingest_handle = spawn_ingest(state.clone(), events_rx);
    let bridge_handle = tokio::spawn(transport.run());
    let api_handle = {
        let state = state.clone();
        let addr = config.api_addr;
        tokio::spawn(async move {
            if let Err(e) = api::start_api_server(state, addr).await {
                error!("API server stopped: {}", e);
            }
        })
    };

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    bridge_handle.abort();
    // The bridge owned the only event sender, so the ingest queue drains and closes.
    let _ = ingest_handle.await;

    info!("Stopped");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Ctrl+C received"),
            Err(e) => {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
