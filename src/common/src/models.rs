//! Domain model: parameter sets, markets, order books, snapshots, attempts,
//! lifecycle telemetry and per-market summaries.
//!
//! All prices are integer points (100 pt = $1.00); see [`crate::price`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Which outcome token a leg refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

/// Terminal/non-terminal state of an [`Attempt`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Active,
    CompletedPaired,
    CompletedFailed,
}

/// Why a terminal attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    SettlementReached,
    BotShutdown,
    StopLoss,
}

/// How a market's cycles are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SamplingMode {
    FixedInterval,
    FixedCount,
}

/// How a trigger level is computed. Only `AskTouch` is implemented; the
/// enum exists so the persisted schema and config surface can express
/// future trigger rules without a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerRule {
    AskTouch,
}

/// Which reference price a parameter set's anomaly check is based on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReferencePriceSource {
    Midpoint,
    LastTrade,
}

/// A named set of measurement parameters. Immutable once created; multiple
/// parameter sets may run against the same market concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct ParameterSet {
    pub parameter_set_id: Option<i64>,
    pub name: String,
    pub s0_points: i64,
    pub delta_points: i64,
    pub trigger_rule: TriggerRule,
    pub reference_price_source: ReferencePriceSource,
    pub stop_loss_threshold_points: Option<i64>,
}

impl ParameterSet {
    /// Ceiling on `P1 + opposite_price` that guarantees >= delta profit.
    pub fn pair_cap_points(&self) -> i64 {
        100 - self.delta_points
    }
}

/// A single 15-minute settlement window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Market {
    pub market_id: String,
    pub crypto_asset: String,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub settlement_time: DateTime<Utc>,
    pub tick_size_points: i64,
}

/// Per-token live order book state. Owned exclusively by the feed; the
/// monitor only ever reads a consistent copy at a cycle boundary.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderBook {
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub last_trade: Option<i64>,
    /// Minimum ask observed since the last reset.
    pub period_low_ask: Option<i64>,
    /// Minimum bid observed since the last reset.
    pub period_low_bid: Option<i64>,
}

impl OrderBook {
    pub fn is_valid(&self) -> bool {
        matches!((self.best_bid, self.best_ask), (Some(b), Some(a)) if b > 0 && a > 0 && b < a)
    }

    /// Fold a freshly observed best bid/ask into the period-low accumulators.
    pub fn observe(&mut self, best_bid: Option<i64>, best_ask: Option<i64>) {
        self.best_bid = best_bid;
        self.best_ask = best_ask;
        if let Some(bid) = best_bid {
            self.period_low_bid = Some(self.period_low_bid.map_or(bid, |p| p.min(bid)));
        }
        if let Some(ask) = best_ask {
            self.period_low_ask = Some(self.period_low_ask.map_or(ask, |p| p.min(ask)));
        }
    }

    /// Consume and clear the period-low accumulators at a cycle boundary.
    pub fn reset_period_low(&mut self) {
        self.period_low_ask = None;
        self.period_low_bid = None;
    }
}

/// One immutable per-cycle view of both sides of a market, handed to every
/// parameter set's evaluator unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub market_id: String,
    pub cycle_number: u64,
    pub timestamp: DateTime<Utc>,
    pub yes_bid: Option<i64>,
    pub yes_ask: Option<i64>,
    pub no_bid: Option<i64>,
    pub no_ask: Option<i64>,
    pub yes_period_low_ask: Option<i64>,
    pub yes_period_low_bid: Option<i64>,
    pub no_period_low_ask: Option<i64>,
    pub no_period_low_bid: Option<i64>,
    pub yes_last_trade: Option<i64>,
    pub no_last_trade: Option<i64>,
    pub time_remaining_seconds: f64,
}

impl Snapshot {
    /// A snapshot is valid when both sides have a complete, sane book.
    pub fn is_valid(&self) -> bool {
        let yes_ok = matches!((self.yes_bid, self.yes_ask), (Some(b), Some(a)) if b < a);
        let no_ok = matches!((self.no_bid, self.no_ask), (Some(b), Some(a)) if b < a);
        yes_ok && no_ok
    }
}

/// A coarse bucket of time remaining until settlement, computed once at
/// attempt creation for offline phase analysis.
pub fn time_remaining_bucket(seconds: f64) -> &'static str {
    if seconds <= 60.0 {
        "0-60"
    } else if seconds <= 180.0 {
        "60-180"
    } else {
        "180-900"
    }
}

/// The central measurement record: one observed first-leg trigger and its
/// subsequent state-machine tracking to pair, stop-loss, or settlement.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Attempt {
    pub attempt_id: Option<i64>,
    pub market_id: String,
    pub parameter_set_id: i64,
    pub cycle_number: i64,
    pub t1_timestamp: DateTime<Utc>,
    pub first_leg_side: Side,
    pub p1_points: i64,
    pub reference_yes_points: f64,
    pub reference_no_points: f64,
    pub opposite_side: Side,
    pub opposite_trigger_points: i64,
    pub opposite_max_points: i64,
    pub delta_points: i64,
    pub s0_points: i64,
    pub stop_loss_threshold_points: Option<i64>,
    pub stop_loss_price_points: Option<i64>,
    pub yes_spread_entry_points: i64,
    pub no_spread_entry_points: i64,
    pub time_remaining_bucket: String,
    pub time_remaining_at_start: f64,
    pub cycles_to_fill_first_leg: i64,
    pub placement_buffer_points: i64,

    // Mutable telemetry, updated every cycle the attempt stays active.
    pub closest_approach_points: Option<i64>,
    pub closest_approach_timestamp: Option<DateTime<Utc>>,
    pub closest_approach_cycle: Option<i64>,
    pub max_adverse_excursion_points: i64,
    pub max_adverse_excursion_timestamp: Option<DateTime<Utc>>,
    pub max_adverse_excursion_cycle: Option<i64>,
    pub had_feed_gap: bool,

    // Terminal fields, set exactly once on transition.
    pub status: AttemptStatus,
    pub t2_timestamp: Option<DateTime<Utc>>,
    pub time_to_pair_seconds: Option<f64>,
    pub actual_opposite_price: Option<i64>,
    pub pair_cost_points: Option<i64>,
    pub pair_profit_points: Option<i64>,
    pub fail_reason: Option<FailReason>,
    pub time_remaining_at_completion: Option<f64>,
    pub yes_spread_exit_points: Option<i64>,
    pub no_spread_exit_points: Option<i64>,

    /// Internal-only sequence number used to key the closest-approach/MAE
    /// trackers for the lifetime of this attempt inside one evaluator.
    /// Never persisted.
    #[serde(skip)]
    #[sqlx(default)]
    pub sequence_number: u64,
}

/// High-volume optional per-cycle telemetry for still-active attempts.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LifecycleRecord {
    pub attempt_id: i64,
    pub cycle_number: i64,
    pub timestamp: DateTime<Utc>,
    pub opposite_ask_points: i64,
    pub distance_to_trigger: i64,
    pub closest_approach_so_far: i64,
}

/// Aggregated counters over one completed market, written once at settlement.
#[derive(Debug, Clone, Default, Serialize, Deserialize, FromRow)]
pub struct MarketSummary {
    pub market_id: String,
    pub attempts: i64,
    pub pairs: i64,
    pub failed: i64,
    pub pair_rate: f64,
    pub avg_time_to_pair_seconds: Option<f64>,
    pub median_time_to_pair_seconds: Option<f64>,
    pub max_concurrent_attempts: i64,
    pub anomaly_count: i64,
}
