//! Domain wrapper owning the market key scheme and serialization.
//!
//! Keys follow `market:{exchange}:{symbol}:{kind}`; order books and
//! tickers are field maps with a 5 minute TTL, recent trades a capped
//! list of 100 with a 1 hour TTL.

use std::sync::Arc;
use std::time::Duration;

use market_types::{topic_symbol, OrderBookSnapshot, TickerSnapshot, TradeEvent};

use crate::{HotCache, Result};

const MAP_TTL: Duration = Duration::from_secs(300);
const TRADES_TTL: Duration = Duration::from_secs(3600);
const TRADES_CAP: usize = 100;

/// Shared, thread-safe view over any [`HotCache`] backend.
#[derive(Clone)]
pub struct MarketCache {
    cache: Arc<dyn HotCache>,
}

impl MarketCache {
    pub fn new(cache: Arc<dyn HotCache>) -> Self {
        Self { cache }
    }

    fn key(exchange: &str, symbol: &str, kind: &str) -> String {
        format!("market:{}:{}:{}", exchange, topic_symbol(symbol), kind)
    }

    pub async fn put_order_book(&self, book: &OrderBookSnapshot) -> Result<()> {
        let key = Self::key(&book.exchange, &book.symbol, "orderbook");
        let fields = vec![
            ("bids".to_string(), serde_json::to_string(&book.bids)?),
            ("asks".to_string(), serde_json::to_string(&book.asks)?),
            ("timestamp".to_string(), book.timestamp.to_string()),
            ("symbol".to_string(), book.symbol.clone()),
        ];
        self.cache.put_map(&key, fields, MAP_TTL).await
    }

    pub async fn order_book(&self, exchange: &str, symbol: &str) -> Result<Option<OrderBookSnapshot>> {
        let key = Self::key(exchange, symbol, "orderbook");
        let Some(map) = self.cache.read_map(&key).await? else {
            return Ok(None);
        };
        let (Some(bids), Some(asks), Some(ts)) =
            (map.get("bids"), map.get("asks"), map.get("timestamp"))
        else {
            return Ok(None);
        };
        Ok(Some(OrderBookSnapshot {
            exchange: exchange.to_string(),
            symbol: map.get("symbol").cloned().unwrap_or_else(|| symbol.to_string()),
            timestamp: ts.parse().unwrap_or(0),
            bids: serde_json::from_str(bids)?,
            asks: serde_json::from_str(asks)?,
            sequence: None,
        }))
    }

    /// Best bid/ask from the cached book, if both sides are present.
    pub async fn best_bid_ask(&self, exchange: &str, symbol: &str) -> Result<Option<(f64, f64)>> {
        let Some(book) = self.order_book(exchange, symbol).await? else {
            return Ok(None);
        };
        match (book.best_bid(), book.best_ask()) {
            (Some(bid), Some(ask)) => Ok(Some((bid, ask))),
            _ => Ok(None),
        }
    }

    pub async fn push_trade(&self, trade: &TradeEvent) -> Result<()> {
        let key = Self::key(&trade.exchange, &trade.symbol, "trades");
        self.cache
            .push_capped(&key, serde_json::to_string(trade)?, TRADES_CAP, TRADES_TTL)
            .await
    }

    /// Cached trades in arrival order, newest last.
    pub async fn recent_trades(&self, exchange: &str, symbol: &str) -> Result<Vec<TradeEvent>> {
        let key = Self::key(exchange, symbol, "trades");
        let raw = self.cache.list(&key).await?;
        let mut trades = Vec::with_capacity(raw.len());
        for entry in raw {
            trades.push(serde_json::from_str(&entry)?);
        }
        Ok(trades)
    }

    pub async fn put_ticker(&self, ticker: &TickerSnapshot) -> Result<()> {
        let key = Self::key(&ticker.exchange, &ticker.symbol, "ticker");
        let fields = vec![
            ("payload".to_string(), serde_json::to_string(ticker)?),
            ("timestamp".to_string(), ticker.timestamp.to_string()),
            ("last".to_string(), ticker.last.to_string()),
        ];
        self.cache.put_map(&key, fields, MAP_TTL).await
    }

    pub async fn ticker(&self, exchange: &str, symbol: &str) -> Result<Option<TickerSnapshot>> {
        let key = Self::key(exchange, symbol, "ticker");
        let Some(map) = self.cache.read_map(&key).await? else {
            return Ok(None);
        };
        match map.get("payload") {
            Some(payload) => Ok(Some(serde_json::from_str(payload)?)),
            None => Ok(None),
        }
    }
}
