//! ringkv-node: entry point for one ringkv server.
//!
//! Loads config, opens the configured databases, starts the maintenance
//! tasks (Merkle flushing, expiry, ring maintenance, peer probing,
//! anti-entropy, repartitioning), then serves all gRPC services on the
//! configured listen address until Ctrl+C.

use ringkv_kv::Store;
use ringkv_net::GrpcPeerClient;
use ringkv_storage::BackendRegistry;
use std::sync::Arc;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ringkv_metrics::init_tracing();

    // Load config: first CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());
    let config = ringkv_config::load_from_file(std::path::Path::new(&config_path)).map_err(|e| {
        tracing::error!("failed to load config from {}: {}", config_path, e);
        e
    })?;
    tracing::info!(
        "server {} ({}/{}) listening on {}",
        config.server_id,
        config.datacenter,
        config.rack,
        config.listen
    );

    let client = Arc::new(GrpcPeerClient::new(Duration::from_millis(
        config.distribute.timeout_ms,
    )));
    let store = Arc::new(Store::open(&config, &BackendRegistry::new(), client)?);

    let tracker = TaskTracker::new();
    let token = CancellationToken::new();
    store.spawn_maintenance(&tracker, &token);

    // Spawn metrics HTTP server if configured
    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = std::net::SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = ringkv_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    // Serve with graceful shutdown on Ctrl+C
    let router = ringkv_net::build_server(store.clone());
    tracing::info!("serving gRPC on {}", config.listen);
    let served = router
        .serve_with_shutdown(config.listen, async {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl+C, shutting down");
            }
        })
        .await;

    token.cancel();
    tracker.close();
    tracker.wait().await;
    store.wind_down().await?;
    tracing::info!("server {} stopped", config.server_id);

    served?;
    Ok(())
}
