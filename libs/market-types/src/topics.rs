//! Bus topic naming scheme.
//!
//! Market data topics are per instrument; signals and insights are global
//! topics partitioned by symbol key.

use crate::symbol::topic_symbol;

/// Subscription kind for a market data feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    Orderbook,
    Trades,
    Ticker,
}

impl SubscriptionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionKind::Orderbook => "orderbook",
            SubscriptionKind::Trades => "trades",
            SubscriptionKind::Ticker => "ticker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "orderbook" => Some(SubscriptionKind::Orderbook),
            "trades" => Some(SubscriptionKind::Trades),
            "ticker" => Some(SubscriptionKind::Ticker),
            _ => None,
        }
    }
}

impl std::fmt::Display for SubscriptionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const TRADING_SIGNALS: &str = "trading.signals";
pub const MARKET_INSIGHTS: &str = "market.insights";

/// `marketdata.{exchange}.{symbol}.{kind}`
pub fn market_data(exchange: &str, symbol: &str, kind: SubscriptionKind) -> String {
    format!("marketdata.{}.{}.{}", exchange, topic_symbol(symbol), kind.as_str())
}

/// Wildcard pattern matching one market data kind across all instruments.
pub fn market_data_pattern(kind: SubscriptionKind) -> String {
    format!("marketdata.*.*.{}", kind.as_str())
}

/// `footprints.processed.{exchange}.{symbol}.{interval}`
pub fn footprints(exchange: &str, symbol: &str, interval_label: &str) -> String {
    format!(
        "footprints.processed.{}.{}.{}",
        exchange,
        topic_symbol(symbol),
        interval_label
    )
}
