//! Common library for the measurement harness.
//!
//! Provides shared functionality:
//! - Integer-point price arithmetic
//! - The domain model (parameter sets, markets, attempts, snapshots)
//! - Configuration loading from the environment
//! - Database connection pooling and persistence
//! - Market discovery and market-data feed adapters

pub mod config;
pub mod db;
pub mod discovery;
pub mod feed;
pub mod models;
pub mod price;
pub mod repository;

pub use config::{ConfigError, DataConfig, FeedConfig, HarnessConfig, MarketsConfig, QualityConfig, SamplingConfig};
pub use db::{DbError, Database};
pub use discovery::{DiscoveryClient, DiscoveryError, GammaDiscoveryClient};
pub use feed::{BookView, ClobFeedClient, FeedClient, FeedError};

#[cfg(any(test, feature = "test-util"))]
pub use discovery::MockDiscoveryClient;
#[cfg(any(test, feature = "test-util"))]
pub use feed::MockFeedClient;
pub use models::{
    time_remaining_bucket, Attempt, AttemptStatus, FailReason, LifecycleRecord, Market,
    MarketSummary, OrderBook, ParameterSet, ReferencePriceSource, SamplingMode, Side, Snapshot,
    TriggerRule,
};
pub use price::{clamp_trigger, midpoint, price_to_points, round_to_tick, PriceError};
pub use repository::{
    insert_attempts_batch, insert_lifecycle_batch, insert_market, insert_parameter_set,
    insert_snapshot, update_attempts_failed_batch, update_attempts_paired_batch,
    update_attempts_stopped_batch, update_market_summary, PersistenceError,
};
