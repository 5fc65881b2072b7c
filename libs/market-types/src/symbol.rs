//! Symbol reference data and price bucketing.

use serde::{Deserialize, Serialize};

use crate::{invalid, Result};

/// Immutable reference data for a tradable market.
///
/// `(exchange, symbol)` is unique; `symbol_id` is the internal numeric id
/// assigned by the symbol registry at registration time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRef {
    /// Lowercase exchange id, e.g. `binance`.
    pub exchange: String,
    /// Normalized market symbol, e.g. `BTC/USDT`.
    pub symbol: String,
    /// Internal numeric id.
    pub symbol_id: i64,
    /// Price tick used for footprint bucketing. Always > 0.
    pub price_tick: f64,
    /// Quote asset, e.g. `USDT`.
    pub quote_asset: String,
}

impl SymbolRef {
    pub fn validate(&self) -> Result<()> {
        if self.exchange.is_empty() {
            return Err(invalid("exchange", "empty"));
        }
        if self.symbol.is_empty() {
            return Err(invalid("symbol", "empty"));
        }
        if self.price_tick <= 0.0 {
            return Err(invalid("price_tick", format!("{} is not > 0", self.price_tick)));
        }
        Ok(())
    }
}

/// Symbol form used in bus topic names: uppercase, separator stripped.
/// `BTC/USDT` -> `BTCUSDT`.
pub fn topic_symbol(symbol: &str) -> String {
    symbol
        .chars()
        .filter(|c| *c != '/' && *c != '-' && *c != ':')
        .collect::<String>()
        .to_uppercase()
}

/// Integer bucket index for a price: `floor(price / tick)`.
///
/// Buckets are keyed by index rather than by float price so that
/// accumulation never depends on float equality.
pub fn bucket_index(price: f64, tick: f64) -> i64 {
    (price / tick).floor() as i64
}

/// Bucket price for a trade: `floor(price / tick) * tick`.
pub fn bucket_price(price: f64, tick: f64) -> f64 {
    bucket_index(price, tick) as f64 * tick
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_symbol_strips_separators() {
        assert_eq!(topic_symbol("BTC/USDT"), "BTCUSDT");
        assert_eq!(topic_symbol("eth-usd"), "ETHUSD");
        assert_eq!(topic_symbol("BTCUSDT"), "BTCUSDT");
    }

    #[test]
    fn test_bucket_price_floors_to_tick() {
        assert_eq!(bucket_price(100.3, 0.5), 100.0);
        assert_eq!(bucket_price(100.7, 0.5), 100.5);
        assert_eq!(bucket_price(99.99, 0.5), 99.5);
    }

    #[test]
    fn test_bucket_boundary_lands_in_own_bucket() {
        // price == k * tick belongs to bucket k
        assert_eq!(bucket_price(100.5, 0.5), 100.5);
        assert_eq!(bucket_index(100.5, 0.5), 201);
        assert_eq!(bucket_price(42.0, 0.5), 42.0);
    }

    #[test]
    fn test_symbol_ref_validation() {
        let mut sym = SymbolRef {
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            symbol_id: 1,
            price_tick: 0.5,
            quote_asset: "USDT".into(),
        };
        assert!(sym.validate().is_ok());

        sym.price_tick = 0.0;
        assert!(sym.validate().is_err());
    }
}
