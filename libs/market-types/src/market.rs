//! Raw market data snapshots produced by the feed.

use serde::{Deserialize, Serialize};

use crate::{invalid, Result};

/// One price level of an order book side.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

impl BookLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Point-in-time order book: bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub exchange: String,
    pub symbol: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    pub fn validate(&self) -> Result<()> {
        if self.timestamp <= 0 {
            return Err(invalid("timestamp", "not positive"));
        }
        if let (Some(bid), Some(ask)) = (self.best_bid(), self.best_ask()) {
            if bid > ask {
                return Err(invalid("bids", format!("crossed book: bid {bid} > ask {ask}")));
            }
        }
        for level in self.bids.iter().chain(self.asks.iter()) {
            if level.size < 0.0 {
                return Err(invalid("size", format!("negative size {}", level.size)));
            }
        }
        if !self.bids.windows(2).all(|w| w[0].price >= w[1].price) {
            return Err(invalid("bids", "not sorted descending"));
        }
        if !self.asks.windows(2).all(|w| w[0].price <= w[1].price) {
            return Err(invalid("asks", "not sorted ascending"));
        }
        Ok(())
    }
}

/// Which side consumed resting liquidity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggressorSide {
    Buy,
    Sell,
    Unknown,
}

impl AggressorSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggressorSide::Buy => "buy",
            AggressorSide::Sell => "sell",
            AggressorSide::Unknown => "unknown",
        }
    }
}

/// A single executed trade from an exchange stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeEvent {
    pub exchange: String,
    pub symbol: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    /// Exchange-scoped trade id.
    pub trade_id: String,
    pub price: f64,
    pub quantity: f64,
    pub side: AggressorSide,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_maker: Option<bool>,
}

impl TradeEvent {
    pub fn validate(&self) -> Result<()> {
        if self.trade_id.is_empty() {
            return Err(crate::ValidationError::MissingField("trade_id"));
        }
        if self.price <= 0.0 {
            return Err(invalid("price", format!("{} is not > 0", self.price)));
        }
        if self.quantity <= 0.0 {
            return Err(invalid("quantity", format!("{} is not > 0", self.quantity)));
        }
        Ok(())
    }
}

/// Rolling 24h mini ticker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerSnapshot {
    pub exchange: String,
    pub symbol: String,
    /// Milliseconds since epoch.
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub last: f64,
    pub base_volume: f64,
    pub quote_volume: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
}

impl TickerSnapshot {
    pub fn validate(&self) -> Result<()> {
        if self.high < self.low {
            return Err(invalid("high", format!("high {} < low {}", self.high, self.low)));
        }
        if self.last < 0.0 {
            return Err(invalid("last", "negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn book() -> OrderBookSnapshot {
        OrderBookSnapshot {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timestamp: 1_700_000_000_000,
            bids: vec![BookLevel::new(100.0, 1.0), BookLevel::new(99.5, 2.0)],
            asks: vec![BookLevel::new(100.5, 1.5), BookLevel::new(101.0, 3.0)],
            sequence: None,
        }
    }

    #[test]
    fn test_order_book_valid() {
        assert!(book().validate().is_ok());
    }

    #[test]
    fn test_crossed_book_rejected() {
        let mut b = book();
        b.bids[0].price = 101.5;
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_negative_size_rejected() {
        let mut b = book();
        b.asks[1].size = -0.1;
        assert!(b.validate().is_err());
    }

    #[test]
    fn test_trade_validation() {
        let trade = TradeEvent {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timestamp: 1_700_000_000_010,
            trade_id: "t-1".into(),
            price: 100.3,
            quantity: 1.0,
            side: AggressorSide::Buy,
            is_maker: None,
        };
        assert!(trade.validate().is_ok());

        let mut bad = trade.clone();
        bad.quantity = 0.0;
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_trade_json_round_trip() {
        let trade = TradeEvent {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timestamp: 1_700_000_000_010,
            trade_id: "t-1".into(),
            price: 100.3,
            quantity: 1.0,
            side: AggressorSide::Sell,
            is_maker: Some(false),
        };
        let json = serde_json::to_string(&trade).unwrap();
        let back: TradeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, trade);
    }

    #[test]
    fn test_ticker_high_low() {
        let mut ticker = TickerSnapshot {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            timestamp: 1,
            open: 100.0,
            high: 110.0,
            low: 95.0,
            last: 105.0,
            base_volume: 10.0,
            quote_volume: 1050.0,
            best_bid: None,
            best_ask: None,
        };
        assert!(ticker.validate().is_ok());
        ticker.low = 120.0;
        assert!(ticker.validate().is_err());
    }
}
