//! Measurement harness supervisor — spawns one asset manager per configured
//! crypto asset and coordinates graceful shutdown across all of them.

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use common::{Database, GammaDiscoveryClient, HarnessConfig};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod asset_manager;
mod evaluator;
mod monitor;
mod status;

use asset_manager::AssetManager;
use status::{AssetStatus, StatusSource};

/// Real-time measurement harness for 15-minute up/down prediction markets.
#[derive(Parser, Debug)]
#[command(name = "harness")]
#[command(about = "Measures pair-completion behavior across 15-minute prediction markets")]
struct Args {
    /// Override the comma-separated crypto assets to monitor (default from env/config)
    #[arg(long)]
    assets: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = HarnessConfig::from_env()?;
    if let Some(assets) = args.assets {
        config.markets.crypto_assets = assets
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }

    info!("=== Measurement Harness ===");
    info!("Assets: {:?}", config.markets.crypto_assets);
    info!("Market type: {}", config.markets.market_type);
    info!("Parameter sets: {}", config.parameter_sets.len());

    let db = Database::connect(&config).await?;
    db.health_check().await?;
    info!("Connected to database");

    let discovery = Arc::new(GammaDiscoveryClient::new(config.gamma_api_url.clone()));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    let mut sources = Vec::new();
    for asset in config.markets.crypto_assets.clone() {
        let pool = db.pool().clone();
        let discovery = discovery.clone();
        let parameter_sets = config.parameter_sets.clone();
        let asset_config = config.clone();
        let shutdown_rx = shutdown_rx.clone();
        let feed_url = config.feed.url.clone();
        let reconnect_max_delay_seconds = config.feed.reconnect_max_delay_seconds;
        let heartbeat_interval_seconds = config.feed.heartbeat_interval_seconds;

        let mut manager = AssetManager::new(
            asset.clone(),
            pool,
            discovery,
            Arc::new(move || {
                common::ClobFeedClient::new(
                    &feed_url,
                    reconnect_max_delay_seconds,
                    heartbeat_interval_seconds,
                )
            }),
            parameter_sets,
            asset_config,
            shutdown_rx,
        );
        sources.push(StatusSource {
            asset: asset.clone(),
            snapshot: manager.snapshot(),
        });
        handles.push(tokio::spawn(async move {
            if let Err(e) = manager.run().await {
                tracing::error!(asset = %asset, "asset manager exited with error: {}", e);
            }
        }));
    }

    let status_task = tokio::spawn(status::run(shutdown_rx.clone(), sources.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        if let Err(e) = handle.await {
            tracing::error!("asset manager task panicked: {}", e);
        }
    }
    let _ = status_task.await;

    let statuses: Vec<AssetStatus> = sources
        .iter()
        .map(|s| {
            let snap = s.snapshot.lock().expect("snapshot lock poisoned").clone();
            AssetStatus {
                asset: s.asset.clone(),
                markets_monitored: snap.markets_monitored,
                total_attempts: snap.total_attempts,
                total_pairs: snap.total_pairs,
                total_failed: snap.total_failed,
            }
        })
        .collect();

    status::print_session_summary(&statuses);
    Ok(())
}
