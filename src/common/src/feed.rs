//! Market-data feed: the collaborator contract (trait) plus a concrete
//! CLOB WebSocket adapter that folds raw book/price-change messages into
//! per-token [`OrderBook`] state with period-low accumulation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use tracing::{debug, info, warn};

use crate::price::{price_to_points, PriceError};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("websocket connection failed: {0}")]
    Connection(#[from] WsError),

    #[error("connection timed out")]
    Timeout,

    #[error("failed to parse message: {0}")]
    Parse(String),

    #[error("price conversion failed: {0}")]
    Price(#[from] PriceError),

    #[error("connection closed")]
    Closed,
}

/// The 4.C contract: a book for a single outcome token, and a best-effort
/// shutdown hook. Implementations own their own reconnect loop internally;
/// callers only ever see the latest observed book.
#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait]
pub trait FeedClient: Send + Sync {
    async fn connect(&self, token_ids: Vec<String>) -> Result<(), FeedError>;
    fn book(&self, token_id: &str) -> Option<BookView>;
    fn reset_period_low(&self, token_id: &str);
    /// Wall-clock instant of the last message processed on any subscribed
    /// token, or `None` before the first message arrives.
    fn last_message_time(&self) -> Option<DateTime<Utc>>;
}

/// A point-in-time read of one token's book, already converted to points.
#[derive(Debug, Clone, Copy, Default)]
pub struct BookView {
    pub best_bid: Option<i64>,
    pub best_ask: Option<i64>,
    pub last_trade: Option<i64>,
    pub period_low_ask: Option<i64>,
    pub period_low_bid: Option<i64>,
}

#[derive(Debug, Clone, Default)]
struct TokenState {
    best_bid: Option<i64>,
    best_ask: Option<i64>,
    last_trade: Option<i64>,
    period_low_ask: Option<i64>,
    period_low_bid: Option<i64>,
}

impl TokenState {
    fn observe_book(&mut self, bid: Option<i64>, ask: Option<i64>) {
        self.best_bid = bid;
        self.best_ask = ask;
        if let Some(b) = bid {
            self.period_low_bid = Some(self.period_low_bid.map_or(b, |p| p.min(b)));
        }
        if let Some(a) = ask {
            self.period_low_ask = Some(self.period_low_ask.map_or(a, |p| p.min(a)));
        }
    }

    fn to_view(&self) -> BookView {
        BookView {
            best_bid: self.best_bid,
            best_ask: self.best_ask,
            last_trade: self.last_trade,
            period_low_ask: self.period_low_ask,
            period_low_bid: self.period_low_bid,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PriceLevel {
    price: String,
}

#[derive(Debug, Clone, Deserialize)]
struct BookMessage {
    asset_id: String,
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
}

/// Only `price_changes[0]` is consulted, matching the upstream websocket
/// client's behavior of ignoring batched changes within a single message.
#[derive(Debug, Clone, Deserialize)]
struct PriceChange {
    asset_id: String,
    best_bid: Option<String>,
    best_ask: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct PriceChangeMessage {
    price_changes: Vec<PriceChange>,
}

#[derive(Debug, Clone, Deserialize)]
struct TradeMessage {
    asset_id: String,
    price: String,
}

#[derive(Debug, Serialize)]
struct SubscribeRequest {
    #[serde(rename = "type")]
    msg_type: String,
    assets_ids: Vec<String>,
}

fn best_of(levels: &[PriceLevel], take_max: bool) -> Option<&str> {
    levels
        .iter()
        .filter_map(|l| l.price.parse::<f64>().ok().map(|v| (v, l.price.as_str())))
        .reduce(|a, b| if take_max == (b.0 > a.0) { b } else { a })
        .map(|(_, s)| s)
}

/// CLOB WebSocket adapter implementing the feed contract, with built-in
/// reconnect/backoff.
pub struct ClobFeedClient {
    ws_url: String,
    reconnect_delay: Duration,
    max_reconnect_delay: Duration,
    heartbeat_interval: Duration,
    state: Arc<Mutex<HashMap<String, TokenState>>>,
    last_message: Arc<std::sync::Mutex<Option<DateTime<Utc>>>>,
}

impl ClobFeedClient {
    /// `max_reconnect_delay_seconds` and `heartbeat_interval_seconds` come
    /// from [`crate::config::FeedConfig`]; reconnect backoff always starts
    /// at 1s and doubles up to the configured cap.
    pub fn new(
        clob_ws_base_url: &str,
        max_reconnect_delay_seconds: u64,
        heartbeat_interval_seconds: u64,
    ) -> Self {
        Self {
            ws_url: format!("{}/market", clob_ws_base_url),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(max_reconnect_delay_seconds),
            heartbeat_interval: Duration::from_secs(heartbeat_interval_seconds),
            state: Arc::new(Mutex::new(HashMap::new())),
            last_message: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    async fn run_connection(&self, token_ids: &[String]) -> Result<(), FeedError> {
        let connect_timeout = Duration::from_secs(30);
        let (mut ws, _) = timeout(connect_timeout, connect_async(&self.ws_url))
            .await
            .map_err(|_| FeedError::Timeout)??;

        info!("feed connected: {}", self.ws_url);

        let request = SubscribeRequest {
            msg_type: "market".to_string(),
            assets_ids: token_ids.to_vec(),
        };
        let msg = serde_json::to_string(&request).map_err(|e| FeedError::Parse(e.to_string()))?;
        ws.send(Message::Text(msg.into())).await?;

        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                msg = ws.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(e) = self.handle_text(&text).await {
                                warn!("feed message dropped: {}", e);
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(FeedError::Closed);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(FeedError::Connection(e)),
                    }
                }
                _ = heartbeat.tick() => {
                    ws.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) -> Result<(), FeedError> {
        let value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| FeedError::Parse(e.to_string()))?;

        if let Some(arr) = value.as_array() {
            for entry in arr {
                self.handle_object(entry).await?;
            }
            return Ok(());
        }
        self.handle_object(&value).await
    }

    async fn handle_object(&self, value: &serde_json::Value) -> Result<(), FeedError> {
        *self.last_message.lock().expect("last_message lock poisoned") = Some(Utc::now());
        let event_type = value.get("event_type").and_then(|v| v.as_str()).unwrap_or("");
        match event_type {
            "book" => {
                let msg: BookMessage =
                    serde_json::from_value(value.clone()).map_err(|e| FeedError::Parse(e.to_string()))?;
                let bid = best_of(&msg.bids, true).map(price_to_points).transpose()?;
                let ask = best_of(&msg.asks, false).map(price_to_points).transpose()?;
                let mut state = self.state.lock().await;
                state.entry(msg.asset_id).or_default().observe_book(bid, ask);
            }
            "price_change" => {
                let msg: PriceChangeMessage =
                    serde_json::from_value(value.clone()).map_err(|e| FeedError::Parse(e.to_string()))?;
                if let Some(change) = msg.price_changes.first() {
                    let bid = change.best_bid.as_deref().map(price_to_points).transpose()?;
                    let ask = change.best_ask.as_deref().map(price_to_points).transpose()?;
                    if bid.is_some() || ask.is_some() {
                        let mut state = self.state.lock().await;
                        let entry = state.entry(change.asset_id.clone()).or_default();
                        entry.observe_book(bid.or(entry.best_bid), ask.or(entry.best_ask));
                    }
                }
            }
            "last_trade_price" => {
                let msg: TradeMessage =
                    serde_json::from_value(value.clone()).map_err(|e| FeedError::Parse(e.to_string()))?;
                let price = price_to_points(&msg.price)?;
                let mut state = self.state.lock().await;
                state.entry(msg.asset_id).or_default().last_trade = Some(price);
            }
            _ => debug!("ignoring feed message of type {:?}", event_type),
        }
        Ok(())
    }
}

#[async_trait]
impl FeedClient for ClobFeedClient {
    async fn connect(&self, token_ids: Vec<String>) -> Result<(), FeedError> {
        let mut delay = self.reconnect_delay;
        loop {
            match self.run_connection(&token_ids).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("feed connection dropped: {}. reconnecting in {:?}", e, delay);
                    sleep(delay).await;
                    delay = std::cmp::min(delay * 2, self.max_reconnect_delay);
                }
            }
        }
    }

    fn book(&self, token_id: &str) -> Option<BookView> {
        self.state
            .try_lock()
            .ok()
            .and_then(|state| state.get(token_id).map(TokenState::to_view))
    }

    fn reset_period_low(&self, token_id: &str) {
        if let Ok(mut state) = self.state.try_lock() {
            if let Some(entry) = state.get_mut(token_id) {
                entry.period_low_ask = None;
                entry.period_low_bid = None;
            }
        }
    }

    fn last_message_time(&self) -> Option<DateTime<Utc>> {
        *self.last_message.lock().expect("last_message lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn best_of_picks_max_bid_and_min_ask() {
        let bids = vec![
            PriceLevel { price: "0.48".into() },
            PriceLevel { price: "0.50".into() },
        ];
        assert_eq!(best_of(&bids, true), Some("0.50"));

        let asks = vec![
            PriceLevel { price: "0.55".into() },
            PriceLevel { price: "0.52".into() },
        ];
        assert_eq!(best_of(&asks, false), Some("0.52"));
    }

    #[tokio::test]
    async fn book_message_updates_period_low_across_two_updates() {
        let client = ClobFeedClient::new("wss://example.invalid", 30, 10);
        let first = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok-1",
            "bids": [{"price": "0.48"}],
            "asks": [{"price": "0.52"}],
        });
        let second = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok-1",
            "bids": [{"price": "0.47"}],
            "asks": [{"price": "0.49"}],
        });
        client.handle_object(&first).await.unwrap();
        client.handle_object(&second).await.unwrap();

        let view = client.book("tok-1").unwrap();
        assert_eq!(view.best_ask, Some(49));
        assert_eq!(view.period_low_ask, Some(49));
        assert_eq!(view.period_low_bid, Some(47));
    }

    #[tokio::test]
    async fn price_change_only_consults_first_entry() {
        let client = ClobFeedClient::new("wss://example.invalid", 30, 10);
        let msg = serde_json::json!({
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "tok-1", "best_bid": "0.50", "best_ask": "0.51"},
                {"asset_id": "tok-1", "best_bid": "0.10", "best_ask": "0.11"},
            ],
        });
        client.handle_object(&msg).await.unwrap();
        let view = client.book("tok-1").unwrap();
        assert_eq!(view.best_bid, Some(50));
        assert_eq!(view.best_ask, Some(51));
    }

    #[tokio::test]
    async fn reset_period_low_clears_accumulators_but_not_book() {
        let client = ClobFeedClient::new("wss://example.invalid", 30, 10);
        let msg = serde_json::json!({
            "event_type": "book",
            "asset_id": "tok-1",
            "bids": [{"price": "0.48"}],
            "asks": [{"price": "0.52"}],
        });
        client.handle_object(&msg).await.unwrap();
        client.reset_period_low("tok-1");
        let view = client.book("tok-1").unwrap();
        assert_eq!(view.best_ask, Some(52));
        assert_eq!(view.period_low_ask, None);
    }
}
