use crate::server::{
    config::SidecarConfig,
    http::router,
    telemetry::{
        increment_keys_transferred, increment_starved_ticks, increment_store_failures,
        record_cached_keys,
    },
};
use keypool::{KeyBuffer, PoolStore, RedisStore, ReplenishObserver, ReplenishOutcome};
use std::sync::Arc;
use tokio::{net::TcpListener, signal};

/// Forwards replenishment ticks to the metric helpers.
struct MetricsObserver;

impl ReplenishObserver for MetricsObserver {
    fn on_tick(&self, outcome: ReplenishOutcome, cached: usize, _threshold: usize) {
        match outcome {
            ReplenishOutcome::Transferred(count) => increment_keys_transferred(count as u64),
            ReplenishOutcome::Starved => increment_starved_ticks(),
            ReplenishOutcome::StoreUnavailable => increment_store_failures(),
            ReplenishOutcome::Sufficient => {}
        }
        record_cached_keys(cached as u64);
    }
}

/// Connects to the pool store, starts the buffer and serves HTTP until
/// Ctrl+C or SIGTERM.
pub async fn run(config: SidecarConfig) -> anyhow::Result<()> {
    let store = RedisStore::connect(
        &config.store.redis_url,
        config.store.keys.clone(),
        config.store.timeout,
    )
    .await?;

    let listener = TcpListener::bind(config.addr).await?;
    log_startup_info(&config);

    serve(listener, Arc::new(store), &config).await
}

async fn serve<S: PoolStore + 'static>(
    listener: TcpListener,
    store: Arc<S>,
    config: &SidecarConfig,
) -> anyhow::Result<()> {
    let buffer = KeyBuffer::spawn_with_observer(store, config.buffer, MetricsObserver)?;

    axum::serve(listener, router(buffer.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The HTTP server has drained; stop refilling a cache nobody reads.
    buffer.shutdown().await?;

    #[cfg(feature = "tracing")]
    tracing::info!(
        served = buffer.served(),
        abandoned = buffer.cached(),
        "Sidecar shut down successfully"
    );
    Ok(())
}

fn log_startup_info(_config: &SidecarConfig) {
    if cfg!(debug_assertions) {
        #[cfg(feature = "tracing")]
        tracing::info!(
            "Starting key sidecar on {} with full config: {:#?}",
            _config.addr,
            _config
        );
    } else {
        #[cfg(feature = "tracing")]
        tracing::info!(
            addr = %_config.addr,
            batch_size = _config.buffer.replenish.batch_size,
            capacity = _config.buffer.capacity,
            "Starting key sidecar"
        );
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::error!("Failed to install SIGTERM handler: {_e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(_e) = signal::ctrl_c().await {
            #[cfg(feature = "tracing")]
            tracing::error!("Failed to install Ctrl+C handler: {_e}");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received Ctrl+C signal");
        },
        () = terminate => {
            #[cfg(feature = "tracing")]
            tracing::info!("Received SIGTERM signal");
        },
    }

    #[cfg(feature = "tracing")]
    tracing::info!("Shutdown signal received, draining requests...");
}
