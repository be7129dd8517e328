//! Integer-point price arithmetic.
//!
//! All prices in this system are integer points, where 100 points = $1.00.
//! Conversion from the feed's decimal-string prices happens only here, using
//! exact decimal arithmetic so no rounding drift creeps in before truncation.

use rust_decimal::Decimal;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PriceError {
    #[error("could not parse '{0}' as a decimal price")]
    DecimalParse(String),

    #[error("tick size must be positive, got {0}")]
    InvalidTick(i64),
}

/// Convert a decimal price string (e.g. "0.55") into integer points (55).
///
/// Uses `Decimal` end to end so the x100 scaling never touches a float;
/// the result is truncated toward zero, matching the source's
/// `int(Decimal(price) * 100)`.
pub fn price_to_points(decimal_string: &str) -> Result<i64, PriceError> {
    let value: Decimal = decimal_string
        .parse()
        .map_err(|_| PriceError::DecimalParse(decimal_string.to_string()))?;
    let scaled = value * Decimal::from(100);
    scaled
        .trunc()
        .to_string()
        .parse()
        .map_err(|_| PriceError::DecimalParse(decimal_string.to_string()))
}

/// Floor `raw` to the nearest multiple of `tick`.
pub fn round_to_tick(raw: i64, tick: i64) -> Result<i64, PriceError> {
    if tick <= 0 {
        return Err(PriceError::InvalidTick(tick));
    }
    Ok(raw.div_euclid(tick) * tick)
}

/// Clamp a trigger level to `[tick, 99]`.
pub fn clamp_trigger(p: i64, tick: i64) -> i64 {
    p.max(tick).min(99)
}

/// Midpoint of a bid/ask pair, as a real number.
pub fn midpoint(bid: i64, ask: i64) -> f64 {
    (bid as f64 + ask as f64) / 2.0
}
