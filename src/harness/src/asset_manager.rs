//! Asset manager: a long-lived per-asset loop of discover, monitor, rotate.

use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use common::{DiscoveryClient, FeedClient, HarnessConfig, Market, MarketSummary, ParameterSet};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::monitor::{MarketMonitor, MonitorError};

const RETRY_ATTEMPTS: u32 = 40;

#[derive(Debug, Error)]
pub enum AssetManagerError {
    #[error("discovery failed: {0}")]
    Discovery(#[from] common::DiscoveryError),

    #[error(transparent)]
    Monitor(#[from] MonitorError),
}

/// Accumulated activity for one asset, shared between the asset manager
/// task and the periodic status reporter / final session summary.
#[derive(Debug, Clone, Default)]
pub struct AssetSnapshot {
    pub markets_monitored: usize,
    pub total_attempts: i64,
    pub total_pairs: i64,
    pub total_failed: i64,
}

impl AssetSnapshot {
    fn record(&mut self, summary: &MarketSummary) {
        self.markets_monitored += 1;
        self.total_attempts += summary.attempts;
        self.total_pairs += summary.pairs;
        self.total_failed += summary.failed;
    }

    pub fn status_line(&self, asset: &str) -> String {
        format!(
            "{}: markets={} attempts={} pairs={} failed={}",
            asset, self.markets_monitored, self.total_attempts, self.total_pairs, self.total_failed
        )
    }
}

/// Runs one crypto asset (e.g. "BTC") from market to market until shutdown.
pub struct AssetManager<D: DiscoveryClient, F: FeedClient> {
    asset: String,
    pool: PgPool,
    discovery: Arc<D>,
    feed_factory: Arc<dyn Fn() -> F + Send + Sync>,
    parameter_sets: Vec<ParameterSet>,
    config: HarnessConfig,
    shutdown: watch::Receiver<bool>,
    last_slug_ts: Option<i64>,
    snapshot: Arc<Mutex<AssetSnapshot>>,
}

impl<D: DiscoveryClient, F: FeedClient> AssetManager<D, F> {
    pub fn new(
        asset: String,
        pool: PgPool,
        discovery: Arc<D>,
        feed_factory: Arc<dyn Fn() -> F + Send + Sync>,
        parameter_sets: Vec<ParameterSet>,
        config: HarnessConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            asset,
            pool,
            discovery,
            feed_factory,
            parameter_sets,
            config,
            shutdown,
            last_slug_ts: None,
            snapshot: Arc::new(Mutex::new(AssetSnapshot::default())),
        }
    }

    /// A cloneable handle onto this manager's accumulated activity, safe to
    /// read from another task while `run` is in progress.
    pub fn snapshot(&self) -> Arc<Mutex<AssetSnapshot>> {
        self.snapshot.clone()
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until the shutdown signal fires.
    pub async fn run(&mut self) -> Result<(), AssetManagerError> {
        while !self.is_shutdown() {
            let market = match self.next_market().await? {
                Some(m) => m,
                None => break,
            };
            self.last_slug_ts = slug_window_start(&market.market_id);

            let parameter_sets: Vec<ParameterSet> = self
                .parameter_sets
                .iter()
                .cloned()
                .map(|mut ps| {
                    ps.parameter_set_id = None;
                    ps
                })
                .collect();
            let feed = Arc::new((self.feed_factory)());
            let mut monitor = MarketMonitor::new(
                self.pool.clone(),
                feed,
                market.clone(),
                parameter_sets,
                self.config.clone(),
                self.shutdown.clone(),
            );
            let summary = monitor.run().await?;
            info!(
                asset = %self.asset,
                market_id = %summary.market_id,
                attempts = summary.attempts,
                pairs = summary.pairs,
                "market monitor finished"
            );
            self.snapshot.lock().expect("snapshot lock poisoned").record(&summary);

            tokio::select! {
                _ = tokio::time::sleep(StdDuration::from_secs(1)) => {}
                _ = self.shutdown.changed() => {}
            }
        }
        Ok(())
    }

    /// Targeted lookup by expected next-window slug, falling back to general
    /// discovery, then bounded retry with linear backoff honoring shutdown.
    async fn next_market(&self) -> Result<Option<Market>, AssetManagerError> {
        if let Some(ts) = self.last_slug_ts {
            let next_ts = ts + common::discovery::WINDOW_SECONDS;
            let slug = format!(
                "{}-updown-{}-{}",
                self.asset.to_lowercase(),
                self.config.markets.market_type,
                next_ts
            );
            if let Some(market) = self.discovery.find_by_slug(&slug, &self.asset).await? {
                return Ok(Some(market));
            }
        }

        for attempt in 0..RETRY_ATTEMPTS {
            if self.is_shutdown() {
                return Ok(None);
            }
            if let Some(market) = self
                .discovery
                .find_active(&self.asset, &self.config.markets.market_type)
                .await?
            {
                return Ok(Some(market));
            }
            warn!(asset = %self.asset, attempt, "no active market found, retrying");
            let backoff = StdDuration::from_secs_f64((2 + attempt as i64).min(5) as f64);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = self.shutdown.clone().changed() => return Ok(None),
            }
        }
        Ok(None)
    }
}

fn slug_window_start(slug: &str) -> Option<i64> {
    slug.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use common::{DataConfig, FeedConfig, MarketsConfig, MockDiscoveryClient, MockFeedClient, QualityConfig, SamplingConfig, SamplingMode};
    use sqlx::postgres::PgPoolOptions;

    #[test]
    fn slug_window_start_parses_trailing_unix_seconds() {
        assert_eq!(slug_window_start("btc-updown-15min-1700000000"), Some(1700000000));
    }

    #[test]
    fn slug_window_start_rejects_malformed_slug() {
        assert_eq!(slug_window_start("btc-updown-15min-"), None);
    }

    // next_market never touches the pool, so a lazy (unconnected) one is fine.
    fn test_pool() -> PgPool {
        PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .expect("lazy pool construction should not touch the network")
    }

    fn test_config() -> HarnessConfig {
        HarnessConfig {
            parameter_sets: vec![],
            sampling: SamplingConfig {
                mode: SamplingMode::FixedInterval,
                cycle_interval_seconds: 5.0,
                cycles_per_market: 180,
            },
            markets: MarketsConfig {
                crypto_assets: vec!["BTC".to_string()],
                market_type: "15min".to_string(),
                discovery_poll_interval_seconds: 2.0,
                pre_discovery_lead_seconds: 30.0,
            },
            data: DataConfig {
                database_url: "postgres://localhost/unused".to_string(),
                enable_snapshots: false,
                enable_lifecycle_tracking: false,
            },
            quality: QualityConfig {
                feed_gap_threshold_seconds: 10.0,
                max_reference_sum_deviation: 2,
                max_anomalies_per_market: 50,
            },
            feed: FeedConfig {
                url: "wss://example.invalid/ws".to_string(),
                heartbeat_interval_seconds: 10,
                reconnect_max_delay_seconds: 60,
            },
            gamma_api_url: "https://example.invalid".to_string(),
            log_file: None,
        }
    }

    fn test_market(slug: &str) -> Market {
        Market {
            market_id: slug.to_string(),
            crypto_asset: "BTC".to_string(),
            yes_token_id: "yes".to_string(),
            no_token_id: "no".to_string(),
            settlement_time: Utc::now() + Duration::minutes(15),
            tick_size_points: 1,
        }
    }

    fn manager_with(
        discovery: MockDiscoveryClient,
        shutdown: watch::Receiver<bool>,
    ) -> AssetManager<MockDiscoveryClient, MockFeedClient> {
        AssetManager::new(
            "BTC".to_string(),
            test_pool(),
            Arc::new(discovery),
            Arc::new(MockFeedClient::new),
            vec![],
            test_config(),
            shutdown,
        )
    }

    #[tokio::test]
    async fn next_market_prefers_targeted_slug_over_broad_discovery() {
        let mut discovery = MockDiscoveryClient::new();
        discovery
            .expect_find_by_slug()
            .withf(|slug, _| slug == "btc-updown-15min-1700000900")
            .returning(|_, _| Box::pin(async { Ok(Some(test_market("btc-updown-15min-1700000900"))) }));
        discovery.expect_find_active().times(0);

        let (_tx, rx) = watch::channel(false);
        let mut manager = manager_with(discovery, rx);
        manager.last_slug_ts = Some(1700000000);

        let market = manager.next_market().await.unwrap().unwrap();
        assert_eq!(market.market_id, "btc-updown-15min-1700000900");
    }

    #[tokio::test]
    async fn next_market_falls_back_to_broad_discovery_without_a_prior_slug() {
        let mut discovery = MockDiscoveryClient::new();
        discovery
            .expect_find_active()
            .times(1)
            .returning(|_, _| Box::pin(async { Ok(Some(test_market("btc-updown-15min-1700001800"))) }));

        let (_tx, rx) = watch::channel(false);
        let manager = manager_with(discovery, rx);

        let market = manager.next_market().await.unwrap().unwrap();
        assert_eq!(market.market_id, "btc-updown-15min-1700001800");
    }

    #[tokio::test]
    async fn next_market_stops_retrying_once_shutdown_fires() {
        let mut discovery = MockDiscoveryClient::new();
        discovery.expect_find_active().returning(|_, _| Box::pin(async { Ok(None) }));

        let (tx, rx) = watch::channel(false);
        let manager = manager_with(discovery, rx);

        tx.send(true).unwrap();
        let market = manager.next_market().await.unwrap();
        assert!(market.is_none());
    }
}
