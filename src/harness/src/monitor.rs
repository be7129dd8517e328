//! Market monitor: runs one market from feed-connect to settlement,
//! producing one [`MarketSummary`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use common::{
    insert_attempts_batch, insert_lifecycle_batch, insert_market, insert_parameter_set,
    insert_snapshot, update_attempts_failed_batch, update_attempts_paired_batch,
    update_attempts_stopped_batch, update_market_summary, FailReason, FeedClient, HarnessConfig,
    Market, MarketSummary, ParameterSet, SamplingMode, Snapshot,
};
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::evaluator::TriggerEvaluator;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("persistence error: {0}")]
    Persistence(#[from] common::PersistenceError),

    #[error("feed connection failed: {0}")]
    Feed(#[from] common::FeedError),
}

pub struct MarketMonitor<F: FeedClient> {
    pool: PgPool,
    feed: Arc<F>,
    market: Market,
    parameter_sets: Vec<ParameterSet>,
    config: HarnessConfig,
    shutdown: watch::Receiver<bool>,
}

impl<F: FeedClient> MarketMonitor<F> {
    pub fn new(
        pool: PgPool,
        feed: Arc<F>,
        market: Market,
        parameter_sets: Vec<ParameterSet>,
        config: HarnessConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            pool,
            feed,
            market,
            parameter_sets,
            config,
            shutdown,
        }
    }

    fn cycle_interval(&self, time_remaining_at_start: f64) -> f64 {
        match self.config.sampling.mode {
            SamplingMode::FixedInterval => self.config.sampling.cycle_interval_seconds,
            SamplingMode::FixedCount => {
                (time_remaining_at_start / self.config.sampling.cycles_per_market.max(1) as f64).max(1.0)
            }
        }
    }

    /// Run the market to settlement or shutdown, returning its summary.
    pub async fn run(&mut self) -> Result<MarketSummary, MonitorError> {
        let time_remaining_at_start =
            (self.market.settlement_time - Utc::now()).num_milliseconds() as f64 / 1000.0;
        if time_remaining_at_start <= 0.0 {
            return Ok(MarketSummary {
                market_id: self.market.market_id.clone(),
                ..Default::default()
            });
        }

        let cycle_interval = self.cycle_interval(time_remaining_at_start);

        // Assign ids to any not-yet-persisted parameter sets and persist the market row.
        for ps in self.parameter_sets.iter_mut() {
            if ps.parameter_set_id.is_none() {
                let id = insert_parameter_set(&self.pool, ps).await?;
                ps.parameter_set_id = Some(id);
            }
        }
        let primary_ps_id = self.parameter_sets[0]
            .parameter_set_id
            .expect("parameter set id assigned above");
        insert_market(
            &self.pool,
            &self.market,
            primary_ps_id,
            time_remaining_at_start,
            cycle_interval,
        )
        .await?;

        // Feed connect: subscribe and wait (bounded) for both books to be valid.
        let token_ids = vec![self.market.yes_token_id.clone(), self.market.no_token_id.clone()];
        {
            let feed = self.feed.clone();
            let ids = token_ids.clone();
            tokio::spawn(async move {
                if let Err(e) = feed.connect(ids).await {
                    warn!("feed connection ended: {}", e);
                }
            });
        }
        let deadline = tokio::time::Instant::now() + StdDuration::from_secs(15);
        loop {
            let yes_ok = self.feed.book(&self.market.yes_token_id).map(|b| b.best_bid.is_some() && b.best_ask.is_some()).unwrap_or(false);
            let no_ok = self.feed.book(&self.market.no_token_id).map(|b| b.best_bid.is_some() && b.best_ask.is_some()).unwrap_or(false);
            if yes_ok && no_ok || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(100)).await;
        }

        let mut evaluators: Vec<TriggerEvaluator> = self
            .parameter_sets
            .iter()
            .cloned()
            .map(|ps| {
                TriggerEvaluator::new(ps, self.market.clone(), self.config.quality.max_reference_sum_deviation)
            })
            .collect();

        let mut cycle_number: i64 = 0;
        let mut was_shutdown = false;
        let started_at = Utc::now();
        let mut total_pairs: i64 = 0;
        let mut total_stopped: i64 = 0;
        let mut anomaly_count: i64 = 0;
        let mut pair_times: Vec<f64> = Vec::new();

        loop {
            // Every cycle after the first is preceded by exactly one
            // interruptible sleep; the first cycle runs immediately.
            if cycle_number > 0 {
                tokio::select! {
                    _ = tokio::time::sleep(StdDuration::from_secs_f64(cycle_interval)) => {}
                    _ = self.shutdown.changed() => {
                        if *self.shutdown.borrow() {
                            was_shutdown = true;
                        }
                    }
                }
                if was_shutdown {
                    break;
                }
            }

            let remaining = (self.market.settlement_time - Utc::now()).num_milliseconds() as f64 / 1000.0;
            if remaining <= 0.0 {
                break;
            }

            let last_seen_message = self.feed.last_message_time().unwrap_or(started_at);
            let gap = (Utc::now() - last_seen_message).num_milliseconds() as f64 / 1000.0;
            let feed_gap = gap > self.config.quality.feed_gap_threshold_seconds;
            if feed_gap {
                for ev in evaluators.iter_mut() {
                    ev.mark_feed_gap();
                }
            }

            if !feed_gap {
                let outcome = self.run_cycle(&mut evaluators, cycle_number, remaining).await;
                total_pairs += outcome.pairs;
                total_stopped += outcome.stopped;
                anomaly_count += outcome.anomalies;
                pair_times.extend(outcome.pair_times);
            }
            cycle_number += 1;
        }

        let fail_reason = if was_shutdown {
            FailReason::BotShutdown
        } else {
            FailReason::SettlementReached
        };
        let now = Utc::now();
        let remaining_at_settlement =
            ((self.market.settlement_time - now).num_milliseconds() as f64 / 1000.0).max(0.0);
        let mut failed_all = Vec::new();
        for ev in evaluators.iter_mut() {
            failed_all.extend(ev.process_settlement(now, remaining_at_settlement, fail_reason));
        }
        if let Err(e) = update_attempts_failed_batch(&self.pool, &failed_all).await {
            warn!(market_id = %self.market.market_id, "failed to persist settlement-failed attempts: {}", e);
        }

        let total_attempts: i64 = total_pairs + total_stopped + failed_all.len() as i64;
        let avg_time_to_pair_seconds = if pair_times.is_empty() {
            None
        } else {
            Some(pair_times.iter().sum::<f64>() / pair_times.len() as f64)
        };
        let median_time_to_pair_seconds = if pair_times.is_empty() {
            None
        } else {
            let mut sorted = pair_times.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let mid = sorted.len() / 2;
            Some(if sorted.len() % 2 == 0 {
                (sorted[mid - 1] + sorted[mid]) / 2.0
            } else {
                sorted[mid]
            })
        };
        let summary = MarketSummary {
            market_id: self.market.market_id.clone(),
            attempts: total_attempts,
            pairs: total_pairs,
            failed: failed_all.len() as i64,
            pair_rate: if total_attempts > 0 {
                total_pairs as f64 / total_attempts as f64
            } else {
                0.0
            },
            avg_time_to_pair_seconds,
            median_time_to_pair_seconds,
            max_concurrent_attempts: evaluators.iter().map(|e| e.max_concurrent() as i64).max().unwrap_or(0),
            anomaly_count,
        };
        if let Err(e) = update_market_summary(&self.pool, &summary).await {
            warn!(market_id = %self.market.market_id, "failed to persist market summary: {}", e);
        }
        info!(market_id = %self.market.market_id, "market settled, summary written");
        Ok(summary)
    }

    /// Runs one sampling cycle across all evaluators and persists its
    /// results. Persistence failures are logged and swallowed rather than
    /// aborting the market: an attempt state transition is never surfaced
    /// as a monitor-level error.
    async fn run_cycle(
        &self,
        evaluators: &mut [TriggerEvaluator],
        cycle_number: i64,
        time_remaining: f64,
    ) -> CycleOutcome {
        let cycle_time = Utc::now();
        let yes = self.feed.book(&self.market.yes_token_id);
        let no = self.feed.book(&self.market.no_token_id);

        let snapshot = Snapshot {
            market_id: self.market.market_id.clone(),
            cycle_number: cycle_number as u64,
            timestamp: cycle_time,
            yes_bid: yes.and_then(|b| b.best_bid),
            yes_ask: yes.and_then(|b| b.best_ask),
            no_bid: no.and_then(|b| b.best_bid),
            no_ask: no.and_then(|b| b.best_ask),
            yes_period_low_ask: yes.and_then(|b| b.period_low_ask),
            yes_period_low_bid: yes.and_then(|b| b.period_low_bid),
            no_period_low_ask: no.and_then(|b| b.period_low_ask),
            no_period_low_bid: no.and_then(|b| b.period_low_bid),
            yes_last_trade: yes.and_then(|b| b.last_trade),
            no_last_trade: no.and_then(|b| b.last_trade),
            time_remaining_seconds: time_remaining,
        };
        self.feed.reset_period_low(&self.market.yes_token_id);
        self.feed.reset_period_low(&self.market.no_token_id);

        let mut new_attempts = Vec::new();
        let mut new_attempt_ranges: Vec<(usize, usize, usize)> = Vec::new();
        let mut paired = Vec::new();
        let mut stopped = Vec::new();
        let mut lifecycle = Vec::new();
        let mut anomalies = 0i64;

        for (idx, ev) in evaluators.iter_mut().enumerate() {
            let result = ev.evaluate_cycle(&snapshot, cycle_number, cycle_time, time_remaining);
            if result.anomaly {
                anomalies += 1;
            }
            let start = new_attempts.len();
            new_attempts.extend(result.new_attempts);
            new_attempt_ranges.push((idx, start, new_attempts.len()));
            paired.extend(result.paired_attempts);
            stopped.extend(result.stopped_out_attempts);
            lifecycle.extend(result.lifecycle_records);
        }

        let pair_times: Vec<f64> = paired.iter().filter_map(|a| a.time_to_pair_seconds).collect();
        let outcome = CycleOutcome {
            pairs: paired.len() as i64,
            stopped: stopped.len() as i64,
            anomalies,
            pair_times,
        };

        if let Err(e) = insert_attempts_batch(&self.pool, &mut new_attempts).await {
            warn!(market_id = %self.market.market_id, cycle_number, "failed to persist new attempts: {}", e);
        }

        // Write the store-assigned ids back into each evaluator's retained
        // active attempts (keyed by sequence_number, scoped per evaluator
        // since sequence numbers are only unique within one evaluator), and
        // backfill any attempt that paired or stopped out in this very
        // cycle — its clone in `paired`/`stopped` was taken before the
        // insert above assigned an id.
        let mut assigned_ids: std::collections::HashMap<(i64, u64), i64> = std::collections::HashMap::new();
        for (idx, start, end) in new_attempt_ranges {
            evaluators[idx].apply_assigned_ids(&new_attempts[start..end]);
            for attempt in &new_attempts[start..end] {
                if let Some(id) = attempt.attempt_id {
                    assigned_ids.insert((attempt.parameter_set_id, attempt.sequence_number), id);
                }
            }
        }
        for attempt in paired.iter_mut().chain(stopped.iter_mut()) {
            if attempt.attempt_id.is_none() {
                attempt.attempt_id =
                    assigned_ids.get(&(attempt.parameter_set_id, attempt.sequence_number)).copied();
            }
        }

        if let Err(e) = update_attempts_paired_batch(&self.pool, &paired).await {
            warn!(market_id = %self.market.market_id, cycle_number, "failed to persist paired attempts: {}", e);
        }
        if let Err(e) = update_attempts_stopped_batch(&self.pool, &stopped).await {
            warn!(market_id = %self.market.market_id, cycle_number, "failed to persist stopped-out attempts: {}", e);
        }
        if self.config.data.enable_lifecycle_tracking && !lifecycle.is_empty() {
            if let Err(e) = insert_lifecycle_batch(&self.pool, &lifecycle).await {
                warn!(market_id = %self.market.market_id, cycle_number, "failed to persist lifecycle rows: {}", e);
            }
        }
        if self.config.data.enable_snapshots {
            if let Err(e) = insert_snapshot(
                &self.pool,
                &snapshot.market_id,
                cycle_number,
                cycle_time,
                snapshot.yes_bid,
                snapshot.yes_ask,
                snapshot.no_bid,
                snapshot.no_ask,
                snapshot.yes_last_trade,
                snapshot.no_last_trade,
                time_remaining,
            )
            .await
            {
                warn!(market_id = %self.market.market_id, cycle_number, "failed to persist snapshot: {}", e);
            }
        }
        outcome
    }
}

struct CycleOutcome {
    pairs: i64,
    stopped: i64,
    anomalies: i64,
    pair_times: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use common::{BookView, MockFeedClient, ParameterSet, ReferencePriceSource, TriggerRule};
    use serial_test::serial;

    fn test_config() -> Option<HarnessConfig> {
        dotenvy::dotenv().ok();
        HarnessConfig::from_env().ok()
    }

    fn test_market(settlement_in: Duration) -> Market {
        Market {
            market_id: format!("btc-updown-15min-monitor-test-{}", Utc::now().timestamp_nanos_opt().unwrap_or(0)),
            crypto_asset: "BTC".into(),
            yes_token_id: "yes-tok".into(),
            no_token_id: "no-tok".into(),
            settlement_time: Utc::now() + settlement_in,
            tick_size_points: 1,
        }
    }

    fn test_parameter_set() -> ParameterSet {
        ParameterSet {
            parameter_set_id: None,
            name: "monitor-test".into(),
            s0_points: 1,
            delta_points: 5,
            trigger_rule: TriggerRule::AskTouch,
            reference_price_source: ReferencePriceSource::Midpoint,
            stop_loss_threshold_points: None,
        }
    }

    fn steady_book() -> BookView {
        BookView {
            best_bid: Some(48),
            best_ask: Some(52),
            last_trade: None,
            period_low_ask: Some(52),
            period_low_bid: Some(48),
        }
    }

    /// A feed that never reports a message after connect: the monitor's
    /// feed-gap detection should skip every cycle and still settle cleanly.
    #[tokio::test]
    #[serial]
    async fn feed_gap_skips_cycles_and_still_settles() {
        let Some(config) = test_config() else { return };
        let pool = match sqlx::PgPool::connect(&config.data.database_url).await {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut feed = MockFeedClient::new();
        feed.expect_connect().returning(|_| Box::pin(async { Ok(()) }));
        feed.expect_book().returning(|_| Some(steady_book()));
        feed.expect_reset_period_low().returning(|_| ());
        feed.expect_last_message_time()
            .returning(|| Some(Utc::now() - Duration::seconds(100)));

        let mut config = config;
        config.quality.feed_gap_threshold_seconds = 1.0;
        config.sampling.mode = SamplingMode::FixedInterval;
        config.sampling.cycle_interval_seconds = 0.05;

        let (_tx, rx) = watch::channel(false);
        let mut monitor = MarketMonitor::new(
            pool,
            Arc::new(feed),
            test_market(Duration::milliseconds(200)),
            vec![test_parameter_set()],
            config,
            rx,
        );
        let summary = monitor.run().await.expect("monitor should settle cleanly");
        assert_eq!(summary.attempts, 0);
        assert_eq!(summary.pairs, 0);
    }

    /// Flipping the shutdown signal mid-market must settle with
    /// `fail_reason = bot_shutdown` rather than running to settlement.
    #[tokio::test]
    #[serial]
    async fn shutdown_mid_market_settles_active_attempts_as_failed() {
        let Some(config) = test_config() else { return };
        let pool = match sqlx::PgPool::connect(&config.data.database_url).await {
            Ok(p) => p,
            Err(_) => return,
        };

        let mut feed = MockFeedClient::new();
        feed.expect_connect().returning(|_| Box::pin(async { Ok(()) }));
        feed.expect_book().returning(|_| Some(steady_book()));
        feed.expect_reset_period_low().returning(|_| ());
        feed.expect_last_message_time().returning(|| Some(Utc::now()));

        let mut config = config;
        config.sampling.cycle_interval_seconds = 60.0;

        let (tx, rx) = watch::channel(false);
        let mut monitor = MarketMonitor::new(
            pool,
            Arc::new(feed),
            test_market(Duration::minutes(15)),
            vec![test_parameter_set()],
            config,
            rx,
        );

        let run = tokio::spawn(async move { monitor.run().await });
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        tx.send(true).expect("receiver still alive");

        let summary = run.await.expect("task join").expect("monitor should settle on shutdown");
        assert_eq!(summary.pairs, 0);
    }

    /// Drives a real fire-then-pair sequence through `MarketMonitor::run`
    /// against a live pool, proving the store-assigned attempt id reaches
    /// the evaluator's active attempt before the pairing update runs.
    #[tokio::test]
    #[serial]
    async fn fires_and_pairs_with_propagated_attempt_id() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let Some(config) = test_config() else { return };
        let pool = match sqlx::PgPool::connect(&config.data.database_url).await {
            Ok(p) => p,
            Err(_) => return,
        };

        // Cycle 0/1 (the connect-wait call plus cycle 0 itself) see a flat
        // book. Cycle 1 tips the yes ask's period low low enough to fire a
        // YES attempt; cycle 2 tips the no ask's period low low enough to
        // pair it.
        let yes_calls = Arc::new(AtomicUsize::new(0));
        let no_calls = Arc::new(AtomicUsize::new(0));
        let yes_calls_cl = yes_calls.clone();
        let no_calls_cl = no_calls.clone();

        let mut feed = MockFeedClient::new();
        feed.expect_connect().returning(|_| Box::pin(async { Ok(()) }));
        feed.expect_reset_period_low().returning(|_| ());
        feed.expect_last_message_time().returning(|| Some(Utc::now()));
        feed.expect_book().returning(move |token_id| match token_id {
            "yes-tok" => {
                let n = yes_calls_cl.fetch_add(1, Ordering::SeqCst);
                Some(BookView {
                    best_bid: Some(48),
                    best_ask: Some(52),
                    last_trade: None,
                    period_low_ask: if n >= 2 { Some(49) } else { None },
                    period_low_bid: Some(48),
                })
            }
            "no-tok" => {
                let n = no_calls_cl.fetch_add(1, Ordering::SeqCst);
                Some(BookView {
                    best_bid: Some(48),
                    best_ask: Some(52),
                    last_trade: None,
                    period_low_ask: if n >= 3 { Some(46) } else { None },
                    period_low_bid: Some(48),
                })
            }
            _ => None,
        });

        let mut config = config;
        config.sampling.mode = SamplingMode::FixedInterval;
        config.sampling.cycle_interval_seconds = 0.05;
        config.quality.feed_gap_threshold_seconds = 60.0;

        let (_tx, rx) = watch::channel(false);
        let mut monitor = MarketMonitor::new(
            pool,
            Arc::new(feed),
            test_market(Duration::milliseconds(300)),
            vec![test_parameter_set()],
            config,
            rx,
        );

        let summary = monitor.run().await.expect("monitor should settle without a persistence error");
        assert_eq!(summary.attempts, 1);
        assert_eq!(summary.pairs, 1);
        assert_eq!(summary.failed, 0);
    }
}
