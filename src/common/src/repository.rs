//! Persistence layer: schema-backed batched writes for attempts, lifecycle
//! rows and per-market summaries.
//!
//! The hot path is "one cycle produces K new + M paired + L lifecycle
//! rows, all inserted as three round-trips" — every `*_batch` function here
//! opens exactly one transaction, issues one statement per record inside
//! it, and commits once. Per-row wrappers exist only for tests.

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use thiserror::Error;

use crate::models::{Attempt, AttemptStatus, FailReason, LifecycleRecord, Market, MarketSummary, ParameterSet};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Pool(#[from] sqlx::Error),

    #[error("record not found: {0}")]
    NotFound(String),
}

/// Insert a new parameter set; de-duplication is not required, each run
/// may create new rows.
pub async fn insert_parameter_set(
    pool: &PgPool,
    ps: &ParameterSet,
) -> Result<i64, PersistenceError> {
    let id = sqlx::query_scalar!(
        r#"
        INSERT INTO parameter_sets
            (name, s0_points, delta_points, trigger_rule, reference_price_source, stop_loss_threshold_points)
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING parameter_set_id
        "#,
        ps.name,
        ps.s0_points,
        ps.delta_points,
        ps.trigger_rule,
        ps.reference_price_source,
        ps.stop_loss_threshold_points,
    )
    .fetch_one(pool)
    .await?;
    Ok(id)
}

/// Upsert a market row, idempotent on `market_id`.
pub async fn insert_market(
    pool: &PgPool,
    market: &Market,
    primary_ps_id: i64,
    time_remaining_at_start: f64,
    cycle_interval_seconds: f64,
) -> Result<(), PersistenceError> {
    sqlx::query!(
        r#"
        INSERT INTO markets
            (market_id, crypto_asset, yes_token_id, no_token_id, settlement_time,
             tick_size_points, primary_parameter_set_id, time_remaining_at_start, cycle_interval_seconds)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (market_id) DO UPDATE SET
            crypto_asset = EXCLUDED.crypto_asset,
            yes_token_id = EXCLUDED.yes_token_id,
            no_token_id = EXCLUDED.no_token_id,
            settlement_time = EXCLUDED.settlement_time,
            tick_size_points = EXCLUDED.tick_size_points,
            primary_parameter_set_id = EXCLUDED.primary_parameter_set_id,
            time_remaining_at_start = EXCLUDED.time_remaining_at_start,
            cycle_interval_seconds = EXCLUDED.cycle_interval_seconds
        "#,
        market.market_id,
        market.crypto_asset,
        market.yes_token_id,
        market.no_token_id,
        market.settlement_time,
        market.tick_size_points,
        primary_ps_id,
        time_remaining_at_start,
        cycle_interval_seconds,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Insert a batch of newly created attempts in one transaction, writing
/// the store-assigned id back into each `Attempt` by position.
pub async fn insert_attempts_batch(
    pool: &PgPool,
    attempts: &mut [Attempt],
) -> Result<(), PersistenceError> {
    if attempts.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for attempt in attempts.iter_mut() {
        let id = sqlx::query_scalar!(
            r#"
            INSERT INTO attempts
                (market_id, parameter_set_id, cycle_number, t1_timestamp, first_leg_side,
                 p1_points, reference_yes_points, reference_no_points, opposite_side,
                 opposite_trigger_points, opposite_max_points, delta_points, s0_points,
                 stop_loss_threshold_points, stop_loss_price_points, yes_spread_entry_points,
                 no_spread_entry_points, time_remaining_bucket, time_remaining_at_start,
                 cycles_to_fill_first_leg, placement_buffer_points, max_adverse_excursion_points,
                 had_feed_gap, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22, $23, $24)
            RETURNING attempt_id
            "#,
            attempt.market_id,
            attempt.parameter_set_id,
            attempt.cycle_number,
            attempt.t1_timestamp,
            attempt.first_leg_side,
            attempt.p1_points,
            attempt.reference_yes_points,
            attempt.reference_no_points,
            attempt.opposite_side,
            attempt.opposite_trigger_points,
            attempt.opposite_max_points,
            attempt.delta_points,
            attempt.s0_points,
            attempt.stop_loss_threshold_points,
            attempt.stop_loss_price_points,
            attempt.yes_spread_entry_points,
            attempt.no_spread_entry_points,
            attempt.time_remaining_bucket,
            attempt.time_remaining_at_start,
            attempt.cycles_to_fill_first_leg,
            attempt.placement_buffer_points,
            attempt.max_adverse_excursion_points,
            attempt.had_feed_gap,
            AttemptStatus::Active,
        )
        .fetch_one(&mut *tx)
        .await?;
        attempt.attempt_id = Some(id);
    }
    tx.commit().await?;
    Ok(())
}

/// Finalize a batch of attempts that paired this cycle, in one transaction.
pub async fn update_attempts_paired_batch(
    pool: &PgPool,
    attempts: &[Attempt],
) -> Result<(), PersistenceError> {
    update_terminal_batch(pool, attempts, AttemptStatus::CompletedPaired).await
}

/// Finalize a batch of attempts stopped out this cycle, in one transaction.
pub async fn update_attempts_stopped_batch(
    pool: &PgPool,
    attempts: &[Attempt],
) -> Result<(), PersistenceError> {
    update_terminal_batch(pool, attempts, AttemptStatus::CompletedFailed).await
}

/// Finalize a batch of attempts failed at settlement/shutdown, in one transaction.
pub async fn update_attempts_failed_batch(
    pool: &PgPool,
    attempts: &[Attempt],
) -> Result<(), PersistenceError> {
    update_terminal_batch(pool, attempts, AttemptStatus::CompletedFailed).await
}

async fn update_terminal_batch(
    pool: &PgPool,
    attempts: &[Attempt],
    expected_status: AttemptStatus,
) -> Result<(), PersistenceError> {
    if attempts.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for attempt in attempts {
        let attempt_id = attempt
            .attempt_id
            .ok_or_else(|| PersistenceError::NotFound("attempt has no assigned id".to_string()))?;
        sqlx::query!(
            r#"
            UPDATE attempts SET
                status = $2,
                t2_timestamp = $3,
                time_to_pair_seconds = $4,
                actual_opposite_price = $5,
                pair_cost_points = $6,
                pair_profit_points = $7,
                fail_reason = $8,
                time_remaining_at_completion = $9,
                yes_spread_exit_points = $10,
                no_spread_exit_points = $11,
                closest_approach_points = $12,
                closest_approach_timestamp = $13,
                closest_approach_cycle = $14,
                max_adverse_excursion_points = $15,
                max_adverse_excursion_timestamp = $16,
                max_adverse_excursion_cycle = $17,
                had_feed_gap = $18
            WHERE attempt_id = $1
            "#,
            attempt_id,
            expected_status,
            attempt.t2_timestamp,
            attempt.time_to_pair_seconds,
            attempt.actual_opposite_price,
            attempt.pair_cost_points,
            attempt.pair_profit_points,
            attempt.fail_reason,
            attempt.time_remaining_at_completion,
            attempt.yes_spread_exit_points,
            attempt.no_spread_exit_points,
            attempt.closest_approach_points,
            attempt.closest_approach_timestamp,
            attempt.closest_approach_cycle,
            attempt.max_adverse_excursion_points,
            attempt.max_adverse_excursion_timestamp,
            attempt.max_adverse_excursion_cycle,
            attempt.had_feed_gap,
        )
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Insert one snapshot row (only called when `data.enable_snapshots` is set).
pub async fn insert_snapshot(
    pool: &PgPool,
    market_id: &str,
    cycle_number: i64,
    timestamp: DateTime<Utc>,
    yes_bid: Option<i64>,
    yes_ask: Option<i64>,
    no_bid: Option<i64>,
    no_ask: Option<i64>,
    yes_last_trade: Option<i64>,
    no_last_trade: Option<i64>,
    time_remaining_seconds: f64,
) -> Result<(), PersistenceError> {
    sqlx::query!(
        r#"
        INSERT INTO snapshots
            (market_id, cycle_number, timestamp, yes_bid, yes_ask, no_bid, no_ask,
             yes_last_trade, no_last_trade, time_remaining_seconds)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        "#,
        market_id,
        cycle_number,
        timestamp,
        yes_bid,
        yes_ask,
        no_bid,
        no_ask,
        yes_last_trade,
        no_last_trade,
        time_remaining_seconds,
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Batch-insert lifecycle telemetry rows, one transaction per cycle.
pub async fn insert_lifecycle_batch(
    pool: &PgPool,
    records: &[LifecycleRecord],
) -> Result<(), PersistenceError> {
    if records.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for record in records {
        sqlx::query!(
            r#"
            INSERT INTO attempt_lifecycle
                (attempt_id, cycle_number, timestamp, opposite_ask_points, distance_to_trigger, closest_approach_so_far)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            record.attempt_id,
            record.cycle_number,
            record.timestamp,
            record.opposite_ask_points,
            record.distance_to_trigger,
            record.closest_approach_so_far,
        )
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Write the final aggregated summary row for a settled market.
pub async fn update_market_summary(
    pool: &PgPool,
    summary: &MarketSummary,
) -> Result<(), PersistenceError> {
    sqlx::query!(
        r#"
        UPDATE markets SET
            attempts = $2,
            pairs = $3,
            failed = $4,
            pair_rate = $5,
            avg_time_to_pair_seconds = $6,
            median_time_to_pair_seconds = $7,
            max_concurrent_attempts = $8,
            anomaly_count = $9,
            settled_at = NOW()
        WHERE market_id = $1
        "#,
        summary.market_id,
        summary.attempts,
        summary.pairs,
        summary.failed,
        summary.pair_rate,
        summary.avg_time_to_pair_seconds,
        summary.median_time_to_pair_seconds,
        summary.max_concurrent_attempts,
        summary.anomaly_count,
    )
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HarnessConfig;
    use crate::db::Database;
    use crate::models::{ReferencePriceSource, Side, TriggerRule};
    use chrono::Duration;

    async fn test_db() -> Option<Database> {
        dotenvy::dotenv().ok();
        let config = HarnessConfig::from_env().ok()?;
        Database::connect(&config).await.ok()
    }

    fn sample_parameter_set() -> ParameterSet {
        ParameterSet {
            parameter_set_id: None,
            name: format!("test-{}", uuid::Uuid::new_v4()),
            s0_points: 1,
            delta_points: 5,
            trigger_rule: TriggerRule::AskTouch,
            reference_price_source: ReferencePriceSource::Midpoint,
            stop_loss_threshold_points: None,
        }
    }

    #[tokio::test]
    async fn inserts_attempts_batch_and_assigns_distinct_ids() {
        let Some(db) = test_db().await else { return };
        let ps_id = insert_parameter_set(db.pool(), &sample_parameter_set())
            .await
            .expect("insert parameter set");

        let market = Market {
            market_id: format!("btc-updown-15min-{}", uuid::Uuid::new_v4()),
            crypto_asset: "BTC".to_string(),
            yes_token_id: "111".to_string(),
            no_token_id: "222".to_string(),
            settlement_time: Utc::now() + Duration::minutes(15),
            tick_size_points: 1,
        };
        insert_market(db.pool(), &market, ps_id, 900.0, 5.0)
            .await
            .expect("insert market");

        let mut attempts: Vec<Attempt> = (0..3)
            .map(|i| test_attempt(&market.market_id, ps_id, i))
            .collect();

        insert_attempts_batch(db.pool(), &mut attempts)
            .await
            .expect("insert attempts batch");

        let ids: Vec<i64> = attempts.iter().map(|a| a.attempt_id.unwrap()).collect();
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), ids.len(), "ids must be distinct");

        sqlx::query!("DELETE FROM attempts WHERE market_id = $1", market.market_id)
            .execute(db.pool())
            .await
            .ok();
        sqlx::query!("DELETE FROM markets WHERE market_id = $1", market.market_id)
            .execute(db.pool())
            .await
            .ok();
        sqlx::query!(
            "DELETE FROM parameter_sets WHERE parameter_set_id = $1",
            ps_id
        )
        .execute(db.pool())
        .await
        .ok();
    }

    fn test_attempt(market_id: &str, parameter_set_id: i64, cycle: i64) -> Attempt {
        Attempt {
            attempt_id: None,
            market_id: market_id.to_string(),
            parameter_set_id,
            cycle_number: cycle,
            t1_timestamp: Utc::now(),
            first_leg_side: Side::Yes,
            p1_points: 49,
            reference_yes_points: 50.0,
            reference_no_points: 50.0,
            opposite_side: Side::No,
            opposite_trigger_points: 46,
            opposite_max_points: 46,
            delta_points: 5,
            s0_points: 1,
            stop_loss_threshold_points: None,
            stop_loss_price_points: None,
            yes_spread_entry_points: 4,
            no_spread_entry_points: 4,
            time_remaining_bucket: "180-900".to_string(),
            time_remaining_at_start: 900.0,
            cycles_to_fill_first_leg: 0,
            placement_buffer_points: 0,
            closest_approach_points: None,
            closest_approach_timestamp: None,
            closest_approach_cycle: None,
            max_adverse_excursion_points: 0,
            max_adverse_excursion_timestamp: None,
            max_adverse_excursion_cycle: None,
            had_feed_gap: false,
            status: AttemptStatus::Active,
            t2_timestamp: None,
            time_to_pair_seconds: None,
            actual_opposite_price: None,
            pair_cost_points: None,
            pair_profit_points: None,
            fail_reason: None,
            time_remaining_at_completion: None,
            yes_spread_exit_points: None,
            no_spread_exit_points: None,
            sequence_number: 0,
        }
    }
}
