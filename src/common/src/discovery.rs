//! Market discovery: the collaborator contract (trait) plus a concrete
//! Gamma API adapter, narrowed from the teacher's general-purpose
//! `GammaClient` to the fixed `{asset}-updown-{type}-{unix_second}` slug
//! shape this harness measures.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::Market;

pub const WINDOW_SECONDS: i64 = 900;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("no market found")]
    NotFound,

    #[error("malformed slug: {0}")]
    MalformedSlug(String),
}

/// The 4.D contract: return the market for a known slug, or discover
/// whatever window is currently active for an asset.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn find_by_slug(&self, slug: &str, asset: &str) -> Result<Option<Market>, DiscoveryError>;
    async fn find_active(&self, asset: &str, market_type: &str) -> Result<Option<Market>, DiscoveryError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaEvent {
    slug: String,
    #[serde(default)]
    end_date: Option<String>,
    #[serde(default)]
    markets: Vec<GammaMarket>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GammaMarket {
    condition_id: String,
    #[serde(default)]
    end_date: Option<String>,
    outcomes: Option<String>,
    clob_token_ids: Option<String>,
}

impl GammaMarket {
    fn parse_token_ids(&self) -> Option<Vec<String>> {
        self.clob_token_ids
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }

    fn parse_outcomes(&self) -> Option<Vec<String>> {
        self.outcomes
            .as_ref()
            .and_then(|s| serde_json::from_str::<Vec<String>>(s).ok())
    }
}

/// Gamma API adapter implementing the discovery contract against the fixed
/// up/down slug shape.
pub struct GammaDiscoveryClient {
    client: Client,
    base_url: String,
}

impl GammaDiscoveryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
        }
    }

    fn expected_slug(asset: &str, market_type: &str, window_start: i64) -> String {
        format!("{}-updown-{}-{}", asset.to_lowercase(), market_type, window_start)
    }

    async fn query_event_by_slug(&self, slug: &str) -> Result<Option<GammaEvent>, DiscoveryError> {
        let url = format!("{}/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[("slug", slug)])
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let events: Vec<GammaEvent> = response.json().await.unwrap_or_default();
        Ok(events.into_iter().next())
    }

    async fn search_events_broadly(&self, asset: &str) -> Result<Option<GammaEvent>, DiscoveryError> {
        let url = format!("{}/events", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("active", "true"),
                ("closed", "false"),
                ("limit", "50"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let events: Vec<GammaEvent> = response.json().await.unwrap_or_default();
        let asset_lower = asset.to_lowercase();
        let matching: Vec<GammaEvent> = events
            .into_iter()
            .filter(|e| e.slug.to_lowercase().contains(&asset_lower))
            .collect();

        let now = Utc::now();
        let containing_now = matching.iter().find(|e| match parse_event_end(e) {
            Some(end) => end > now && end - chrono::Duration::seconds(WINDOW_SECONDS) <= now,
            None => false,
        });
        if let Some(event) = containing_now {
            return Ok(Some(clone_event(event)));
        }

        Ok(matching
            .into_iter()
            .filter(|e| parse_event_end(e).map(|end| end > now).unwrap_or(false))
            .min_by_key(|e| parse_event_end(e).unwrap_or(DateTime::<Utc>::MAX_UTC)))
    }

    fn to_market(&self, event: &GammaEvent) -> Option<Market> {
        let market = event.markets.first()?;
        let token_ids = market.parse_token_ids()?;
        if token_ids.len() != 2 {
            return None;
        }
        let outcomes = market.parse_outcomes().unwrap_or_default();
        let (yes_idx, no_idx) = outcome_indices(&outcomes);

        let settlement_time = market
            .end_date
            .as_deref()
            .and_then(parse_rfc3339)
            .or_else(|| event.end_date.as_deref().and_then(parse_rfc3339))
            .or_else(|| slug_settlement_fallback(&event.slug))?;

        Some(Market {
            market_id: event.slug.clone(),
            crypto_asset: extract_asset_from_slug(&event.slug),
            yes_token_id: token_ids[yes_idx].clone(),
            no_token_id: token_ids[no_idx].clone(),
            settlement_time,
            tick_size_points: 1,
        })
    }
}

#[async_trait]
impl DiscoveryClient for GammaDiscoveryClient {
    async fn find_by_slug(&self, slug: &str, _asset: &str) -> Result<Option<Market>, DiscoveryError> {
        let event = self.query_event_by_slug(slug).await?;
        Ok(event.as_ref().and_then(|e| self.to_market(e)))
    }

    async fn find_active(&self, asset: &str, market_type: &str) -> Result<Option<Market>, DiscoveryError> {
        let now_window = (Utc::now().timestamp() / WINDOW_SECONDS) * WINDOW_SECONDS;
        for candidate_start in [now_window, now_window + WINDOW_SECONDS, now_window - WINDOW_SECONDS] {
            let slug = Self::expected_slug(asset, market_type, candidate_start);
            match self.query_event_by_slug(&slug).await {
                Ok(Some(event)) => {
                    if let Some(market) = self.to_market(&event) {
                        return Ok(Some(market));
                    }
                }
                Ok(None) => {}
                Err(e) => debug!("targeted lookup for {} failed: {}", slug, e),
            }
        }

        match self.search_events_broadly(asset).await {
            Ok(Some(event)) => Ok(self.to_market(&event)),
            Ok(None) => Ok(None),
            Err(e) => {
                warn!("broad discovery search failed: {}", e);
                Err(e)
            }
        }
    }
}

fn clone_event(e: &GammaEvent) -> GammaEvent {
    GammaEvent {
        slug: e.slug.clone(),
        end_date: e.end_date.clone(),
        markets: e
            .markets
            .iter()
            .map(|m| GammaMarket {
                condition_id: m.condition_id.clone(),
                end_date: m.end_date.clone(),
                outcomes: m.outcomes.clone(),
                clob_token_ids: m.clob_token_ids.clone(),
            })
            .collect(),
    }
}

fn parse_event_end(e: &GammaEvent) -> Option<DateTime<Utc>> {
    e.end_date.as_deref().and_then(parse_rfc3339)
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc))
}

/// `slug_ts + WINDOW_SECONDS` fallback when no endDate is present anywhere.
fn slug_settlement_fallback(slug: &str) -> Option<DateTime<Utc>> {
    let ts: i64 = slug.rsplit('-').next()?.parse().ok()?;
    Utc.timestamp_opt(ts + WINDOW_SECONDS, 0).single()
}

fn extract_asset_from_slug(slug: &str) -> String {
    slug.split('-').next().unwrap_or("unknown").to_uppercase()
}

fn outcome_indices(outcomes: &[String]) -> (usize, usize) {
    if outcomes.len() != 2 {
        return (0, 1);
    }
    let yes_pos = outcomes.iter().position(|o| {
        let lower = o.to_lowercase();
        lower == "yes" || lower == "up"
    });
    let no_pos = outcomes.iter().position(|o| {
        let lower = o.to_lowercase();
        lower == "no" || lower == "down"
    });
    match (yes_pos, no_pos) {
        (Some(y), Some(n)) => (y, n),
        _ => (0, 1),
    }
}
