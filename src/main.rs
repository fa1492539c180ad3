//! Sanchay Vault maintenance daemon
//!
//! Runs the upload-session TTL sweep and chunk garbage collection on fixed
//! intervals against the configured backends.

use std::time::Duration;

use anyhow::Context;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sanchay_vault::{ChunkEngine, Config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "sanchay_vault=debug".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();

    let config = Config::from_env().unwrap_or_else(|e| {
        tracing::warn!("Failed to load config from env: {}, using defaults", e);
        Config::default()
    });

    tracing::info!("Starting Sanchay Vault v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", config.database.url);

    let engine = ChunkEngine::from_config(&config)
        .await
        .context("Failed to initialize storage engine")?;

    let sweeper = tokio::spawn(session_sweeper(
        engine.clone(),
        Duration::from_secs(config.upload.sweep_interval_secs.max(1)),
    ));
    let collector = tokio::spawn(garbage_collector(
        engine.clone(),
        Duration::from_secs(config.gc.interval_secs.max(1)),
    ));

    shutdown_signal().await;

    sweeper.abort();
    collector.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

/// Periodically reclaim expired upload sessions
async fn session_sweeper(engine: ChunkEngine, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        if let Err(e) = engine.sweep_sessions().await {
            tracing::error!(error = %e, "Session sweep failed");
        }
    }
}

/// Periodically collect unreferenced chunks
async fn garbage_collector(engine: ChunkEngine, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        match engine.collect_garbage().await {
            Ok(_) => {
                if let Ok(stats) = engine.dedup_stats().await {
                    tracing::debug!(
                        unique_chunks = stats.unique_chunks,
                        total_refs = stats.total_refs,
                        saved_bytes = stats.saved_bytes,
                        "Dedup stats"
                    );
                }
            }
            Err(e) => tracing::error!(error = %e, "Garbage collection failed"),
        }
    }
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}
