//! Trading signals emitted by the strategy engine and oracle insights.

use serde::{Deserialize, Serialize};

use crate::order::{OrderKind, OrderSide};
use crate::{invalid, Result, ValidationError};

/// A concrete trade intent for the executor.
///
/// Exactly one of `amount` (base) or `quote_amount` is present; a limit
/// order carries `limit_price`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub strategy_id: i64,
    pub owner_id: i64,
    pub exchange_config_id: i64,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    /// Digest of the strategy state that produced this signal; the
    /// exactly-once key per `(strategy_id, state_digest)`.
    pub state_digest: String,
    /// Wall clock at emission, milliseconds since epoch.
    pub timestamp: i64,
}

impl TradingSignal {
    pub fn validate(&self) -> Result<()> {
        if self.exchange.is_empty() {
            return Err(ValidationError::MissingField("exchange"));
        }
        if self.symbol.is_empty() {
            return Err(ValidationError::MissingField("symbol"));
        }
        match (self.amount, self.quote_amount) {
            (Some(a), None) if a > 0.0 => {}
            (None, Some(q)) if q > 0.0 => {}
            (Some(_), Some(_)) => {
                return Err(invalid("amount", "both amount and quote_amount present"))
            }
            (None, None) => return Err(ValidationError::MissingField("amount")),
            _ => return Err(invalid("amount", "not > 0")),
        }
        if self.kind == OrderKind::Limit {
            match self.limit_price {
                Some(p) if p > 0.0 => {}
                _ => return Err(ValidationError::MissingField("limit_price")),
            }
        }
        Ok(())
    }
}

/// Order book pressure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pressure {
    BuyPressure,
    SellPressure,
    Balanced,
}

/// Periodic market observation published to `market.insights`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OracleInsight {
    pub exchange: String,
    pub symbol: String,
    /// Insight discriminator, currently always `orderbook_imbalance`.
    pub insight_type: String,
    /// `bid_volume / (bid_volume + ask_volume)` over the probed depth.
    pub ratio: f64,
    pub classification: Pressure,
    /// Distance of the ratio from balance, scaled to [0, 1].
    pub confidence: f64,
    pub message: String,
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signal() -> TradingSignal {
        TradingSignal {
            strategy_id: 7,
            owner_id: 3,
            exchange_config_id: 1,
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            amount: Some(0.1),
            quote_amount: None,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            state_digest: "abc".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_valid_market_signal() {
        assert!(signal().validate().is_ok());
    }

    #[test]
    fn test_exactly_one_amount() {
        let mut s = signal();
        s.quote_amount = Some(500.0);
        assert!(s.validate().is_err());

        s.amount = None;
        assert!(s.validate().is_ok());

        s.quote_amount = None;
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_limit_requires_price() {
        let mut s = signal();
        s.kind = OrderKind::Limit;
        assert!(s.validate().is_err());
        s.limit_price = Some(100.5);
        assert!(s.validate().is_ok());
    }
}
