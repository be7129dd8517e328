//! Periodic status reporting and the graceful-shutdown session summary.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use tokio::sync::watch;
use tracing::info;

use crate::asset_manager::AssetSnapshot;

const STATUS_INTERVAL_SECONDS: u64 = 30;

/// One asset manager's accumulated activity, as exposed for reporting.
pub struct AssetStatus {
    pub asset: String,
    pub markets_monitored: usize,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
}

/// An asset manager's name plus a shared handle onto its live snapshot.
#[derive(Clone)]
pub struct StatusSource {
    pub asset: String,
    pub snapshot: Arc<Mutex<AssetSnapshot>>,
}

/// Logs one line per asset manager every 30 s until the shutdown signal fires.
pub async fn run(mut shutdown: watch::Receiver<bool>, sources: Vec<StatusSource>) {
    let mut interval = tokio::time::interval(StdDuration::from_secs(STATUS_INTERVAL_SECONDS));
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                for source in &sources {
                    let snap = source.snapshot.lock().expect("snapshot lock poisoned");
                    info!("{}", snap.status_line(&source.asset));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Logs the final session summary in the teacher's Unicode-box style.
pub fn print_session_summary(statuses: &[AssetStatus]) {
    let markets_monitored: usize = statuses.iter().map(|s| s.markets_monitored).sum();
    let total_attempts: i64 = statuses.iter().map(|s| s.total_attempts).sum();
    let total_pairs: i64 = statuses.iter().map(|s| s.total_pairs).sum();
    let total_failed: i64 = statuses.iter().map(|s| s.total_failed).sum();
    let pair_rate = if total_attempts > 0 {
        total_pairs as f64 / total_attempts as f64
    } else {
        0.0
    };

    info!("╔════════════════════════════════════════════════════════════╗");
    info!("║              MEASUREMENT HARNESS SESSION SUMMARY           ║");
    info!("╠════════════════════════════════════════════════════════════╣");
    info!(
        "║  Markets Monitored: {:>8}                                 ║",
        markets_monitored
    );
    info!(
        "║  Total Attempts:    {:>8}                                 ║",
        total_attempts
    );
    info!(
        "║  Total Pairs:       {:>8}                                 ║",
        total_pairs
    );
    info!(
        "║  Total Failed:      {:>8}                                 ║",
        total_failed
    );
    info!(
        "║  Pair Rate:         {:>7.1}%                                ║",
        pair_rate * 100.0
    );
    info!("╠════════════════════════════════════════════════════════════╣");
    for s in statuses {
        info!(
            "║  {:<10} markets={:<4} attempts={:<6} pairs={:<6} failed={:<6} ║",
            s.asset, s.markets_monitored, s.total_attempts, s.total_pairs, s.total_failed
        );
    }
    info!("╚════════════════════════════════════════════════════════════╝");
}
