//! Configuration loading from environment variables.
//!
//! Parsing a config *file* is out of scope for this crate (a collaborator's
//! job); the environment-variable surface below is the complete in-scope
//! configuration path. See `.env` conventions in the workspace README.

use std::env;
use thiserror::Error;

use crate::models::{ParameterSet, ReferencePriceSource, SamplingMode, TriggerRule};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("configuration is invalid:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SamplingConfig {
    pub mode: SamplingMode,
    pub cycle_interval_seconds: f64,
    pub cycles_per_market: u32,
}

#[derive(Debug, Clone)]
pub struct MarketsConfig {
    pub crypto_assets: Vec<String>,
    pub market_type: String,
    pub discovery_poll_interval_seconds: f64,
    pub pre_discovery_lead_seconds: f64,
}

#[derive(Debug, Clone)]
pub struct DataConfig {
    pub database_url: String,
    pub enable_snapshots: bool,
    pub enable_lifecycle_tracking: bool,
}

#[derive(Debug, Clone)]
pub struct QualityConfig {
    pub feed_gap_threshold_seconds: f64,
    pub max_reference_sum_deviation: i64,
    pub max_anomalies_per_market: u32,
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    pub heartbeat_interval_seconds: u64,
    pub reconnect_max_delay_seconds: u64,
}

/// Complete measurement-harness configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub parameter_sets: Vec<ParameterSet>,
    pub sampling: SamplingConfig,
    pub markets: MarketsConfig,
    pub data: DataConfig,
    pub quality: QualityConfig,
    pub feed: FeedConfig,
    pub gamma_api_url: String,
    pub log_file: Option<String>,
}

impl HarnessConfig {
    /// Load from `.env` (if present) plus the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_env_only()
    }

    /// Load from the process environment only — used by tests so they are
    /// not affected by a developer's local `.env`.
    pub fn from_env_only() -> Result<Self, ConfigError> {
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".to_string()))?;

        let parameter_sets = load_parameter_sets()?;

        let sampling = SamplingConfig {
            mode: parse_sampling_mode(&env_or("SAMPLING_MODE", "FIXED_INTERVAL"))?,
            cycle_interval_seconds: parse_f64("CYCLE_INTERVAL_SECONDS", 5.0)?,
            cycles_per_market: parse_u32("CYCLES_PER_MARKET", 180)?,
        };

        let markets = MarketsConfig {
            crypto_assets: env_or("CRYPTO_ASSETS", "BTC")
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            market_type: env_or("MARKET_TYPE", "15min"),
            discovery_poll_interval_seconds: parse_f64("DISCOVERY_POLL_INTERVAL_SECONDS", 2.0)?,
            pre_discovery_lead_seconds: parse_f64("PRE_DISCOVERY_LEAD_SECONDS", 30.0)?,
        };

        let data = DataConfig {
            database_url,
            enable_snapshots: parse_bool("ENABLE_SNAPSHOTS", false)?,
            enable_lifecycle_tracking: parse_bool("ENABLE_LIFECYCLE_TRACKING", false)?,
        };

        let quality = QualityConfig {
            feed_gap_threshold_seconds: parse_f64("FEED_GAP_THRESHOLD_SECONDS", 10.0)?,
            max_reference_sum_deviation: parse_i64("MAX_REFERENCE_SUM_DEVIATION", 2)?,
            max_anomalies_per_market: parse_u32("MAX_ANOMALIES_PER_MARKET", 50)?,
        };

        let feed = FeedConfig {
            url: env_or(
                "FEED_WS_URL",
                "wss://ws-subscriptions-clob.polymarket.com/ws/market",
            ),
            heartbeat_interval_seconds: parse_u32("FEED_HEARTBEAT_INTERVAL_SECONDS", 10)? as u64,
            reconnect_max_delay_seconds: parse_u32("FEED_RECONNECT_MAX_DELAY_SECONDS", 60)? as u64,
        };

        let config = Self {
            parameter_sets,
            sampling,
            markets,
            data,
            quality,
            feed,
            gamma_api_url: env_or("GAMMA_API_URL", "https://gamma-api.polymarket.com"),
            log_file: env::var("LOG_FILE").ok(),
        };

        config.validate()?;
        Ok(config)
    }

    /// Collect every validation violation rather than failing on the first,
    /// mirroring the source prototype's accumulate-then-raise behavior.
    fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.parameter_sets.is_empty() {
            errors.push("at least one parameter set must be configured".to_string());
        }
        for ps in &self.parameter_sets {
            if !(0..50).contains(&ps.s0_points) {
                errors.push(format!(
                    "parameter set '{}': S0_points must be in [0,50), got {}",
                    ps.name, ps.s0_points
                ));
            }
            if !(0..50).contains(&ps.delta_points) || ps.delta_points == 0 {
                errors.push(format!(
                    "parameter set '{}': delta_points must be in (0,50), got {}",
                    ps.name, ps.delta_points
                ));
            }
            if let Some(sl) = ps.stop_loss_threshold_points {
                if !(0..50).contains(&sl) || sl == 0 {
                    errors.push(format!(
                        "parameter set '{}': stop_loss_threshold_points must be in (0,50), got {}",
                        ps.name, sl
                    ));
                }
            }
        }
        if self.sampling.cycle_interval_seconds <= 0.0 {
            errors.push("sampling.cycle_interval_seconds must be > 0".to_string());
        }
        if self.sampling.cycles_per_market == 0 {
            errors.push("sampling.cycles_per_market must be > 0".to_string());
        }
        if self.markets.crypto_assets.is_empty() {
            errors.push("markets.crypto_assets must name at least one asset".to_string());
        }
        if self.quality.feed_gap_threshold_seconds <= 0.0 {
            errors.push("quality.feed_gap_threshold_seconds must be > 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_f64(key: &str, default: f64) -> Result<f64, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("'{v}' is not a number"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_i64(key: &str, default: i64) -> Result<i64, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("'{v}' is not an integer"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_u32(key: &str, default: u32) -> Result<u32, ConfigError> {
    match env::var(key) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidValue {
            field: key.to_string(),
            reason: format!("'{v}' is not a non-negative integer"),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                field: key.to_string(),
                reason: format!("'{v}' is not a boolean"),
            }),
        },
        Err(_) => Ok(default),
    }
}

fn parse_sampling_mode(value: &str) -> Result<SamplingMode, ConfigError> {
    match value {
        "FIXED_INTERVAL" => Ok(SamplingMode::FixedInterval),
        "FIXED_COUNT" => Ok(SamplingMode::FixedCount),
        other => Err(ConfigError::InvalidValue {
            field: "SAMPLING_MODE".to_string(),
            reason: format!("'{other}' is not FIXED_INTERVAL or FIXED_COUNT"),
        }),
    }
}

/// Cartesian-product parameter-set generation from `DELTA_POINTS` x
/// `S0_POINTS` x `STOP_LOSS_THRESHOLD` comma-separated env lists. Falls
/// back to a single hardcoded baseline set when none of the three are
/// configured.
fn load_parameter_sets() -> Result<Vec<ParameterSet>, ConfigError> {
    let deltas = parse_int_list("DELTA_POINTS")?;
    let s0s = parse_int_list("S0_POINTS")?;
    let stop_losses = parse_optional_int_list("STOP_LOSS_THRESHOLD")?;

    if deltas.is_empty() && s0s.is_empty() && stop_losses.is_empty() {
        return Ok(vec![ParameterSet {
            parameter_set_id: None,
            name: "baseline".to_string(),
            s0_points: 1,
            delta_points: 5,
            trigger_rule: TriggerRule::AskTouch,
            reference_price_source: ReferencePriceSource::Midpoint,
            stop_loss_threshold_points: None,
        }]);
    }

    let deltas = if deltas.is_empty() { vec![5] } else { deltas };
    let s0s = if s0s.is_empty() { vec![1] } else { s0s };
    let stop_losses = if stop_losses.is_empty() {
        vec![None]
    } else {
        stop_losses
    };

    let mut sets = Vec::new();
    for &s0 in &s0s {
        for &delta in &deltas {
            for &stop_loss in &stop_losses {
                let name = match stop_loss {
                    Some(sl) => format!("s0{s0}_d{delta}_sl{sl}"),
                    None => format!("s0{s0}_d{delta}"),
                };
                sets.push(ParameterSet {
                    parameter_set_id: None,
                    name,
                    s0_points: s0,
                    delta_points: delta,
                    trigger_rule: TriggerRule::AskTouch,
                    reference_price_source: ReferencePriceSource::Midpoint,
                    stop_loss_threshold_points: stop_loss,
                });
            }
        }
    }
    Ok(sets)
}

fn parse_int_list(key: &str) -> Result<Vec<i64>, ConfigError> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .split(',')
            .map(|s| {
                s.trim().parse().map_err(|_| ConfigError::InvalidValue {
                    field: key.to_string(),
                    reason: format!("'{s}' is not an integer"),
                })
            })
            .collect(),
        _ => Ok(Vec::new()),
    }
}

fn parse_optional_int_list(key: &str) -> Result<Vec<Option<i64>>, ConfigError> {
    Ok(parse_int_list(key)?.into_iter().map(Some).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn missing_database_url_is_an_error() {
        env::remove_var("DATABASE_URL");
        let result = HarnessConfig::from_env_only();
        assert!(matches!(result, Err(ConfigError::MissingEnvVar(_))));
    }

    #[test]
    #[serial]
    fn defaults_to_single_baseline_parameter_set() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::remove_var("DELTA_POINTS");
        env::remove_var("S0_POINTS");
        env::remove_var("STOP_LOSS_THRESHOLD");

        let config = HarnessConfig::from_env_only().unwrap();
        assert_eq!(config.parameter_sets.len(), 1);
        assert_eq!(config.parameter_sets[0].name, "baseline");
        assert_eq!(config.parameter_sets[0].delta_points, 5);

        env::remove_var("DATABASE_URL");
    }

    #[test]
    #[serial]
    fn generates_cartesian_product_of_parameter_axes() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("DELTA_POINTS", "3,5");
        env::set_var("S0_POINTS", "1,2");
        env::remove_var("STOP_LOSS_THRESHOLD");

        let config = HarnessConfig::from_env_only().unwrap();
        assert_eq!(config.parameter_sets.len(), 4);
        assert!(config
            .parameter_sets
            .iter()
            .any(|p| p.name == "s01_d3" && p.s0_points == 1 && p.delta_points == 3));

        env::remove_var("DATABASE_URL");
        env::remove_var("DELTA_POINTS");
        env::remove_var("S0_POINTS");
    }

    #[test]
    #[serial]
    fn rejects_out_of_range_delta() {
        env::set_var("DATABASE_URL", "postgres://localhost/test");
        env::set_var("DELTA_POINTS", "0");
        env::remove_var("S0_POINTS");
        env::remove_var("STOP_LOSS_THRESHOLD");

        let result = HarnessConfig::from_env_only();
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        env::remove_var("DATABASE_URL");
        env::remove_var("DELTA_POINTS");
    }
}
