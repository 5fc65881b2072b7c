//! Symbol registry with a TTL'd in-process lookup cache.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use market_types::SymbolRef;

use crate::models::DbSymbol;
use crate::{retry_query, Result, TimeSeriesStore};

const LOOKUP_TTL: Duration = Duration::from_secs(600);

struct CachedSymbol {
    symbol: SymbolRef,
    loaded_at: Instant,
}

/// `(exchange, symbol) -> SymbolRef` cache in front of the symbols table.
#[derive(Clone)]
pub(crate) struct SymbolRegistry {
    entries: std::sync::Arc<DashMap<(String, String), CachedSymbol>>,
}

impl SymbolRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: std::sync::Arc::new(DashMap::new()),
        }
    }

    fn get(&self, exchange: &str, symbol: &str) -> Option<SymbolRef> {
        let key = (exchange.to_string(), symbol.to_string());
        // expired entries are left in place; the reload overwrites them
        match self.entries.get(&key) {
            Some(entry) if entry.loaded_at.elapsed() < LOOKUP_TTL => Some(entry.symbol.clone()),
            _ => None,
        }
    }

    fn put(&self, symbol: SymbolRef) {
        self.entries.insert(
            (symbol.exchange.clone(), symbol.symbol.clone()),
            CachedSymbol {
                symbol,
                loaded_at: Instant::now(),
            },
        );
    }
}

impl TimeSeriesStore {
    /// Create or refresh a symbol; returns the assigned reference.
    pub async fn register_symbol(
        &self,
        exchange: &str,
        symbol: &str,
        price_tick: f64,
        quote_asset: &str,
    ) -> Result<SymbolRef> {
        retry_query!(sqlx::query(
            r#"
            INSERT INTO symbols (exchange, symbol, price_tick, quote_asset)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (exchange, symbol)
            DO UPDATE SET price_tick = excluded.price_tick, quote_asset = excluded.quote_asset
            "#,
        )
        .bind(exchange)
        .bind(symbol)
        .bind(price_tick)
        .bind(quote_asset)
        .execute(self.pool()))?;

        let row: DbSymbol =
            sqlx::query_as("SELECT id, exchange, symbol, price_tick, quote_asset FROM symbols WHERE exchange = ? AND symbol = ?")
                .bind(exchange)
                .bind(symbol)
                .fetch_one(self.pool())
                .await?;

        let sym = SymbolRef {
            exchange: row.exchange,
            symbol: row.symbol,
            symbol_id: row.id,
            price_tick: row.price_tick,
            quote_asset: row.quote_asset,
        };
        self.symbols.put(sym.clone());
        Ok(sym)
    }

    /// Cached lookup; a miss loads from the symbols table.
    pub async fn symbol_ref(&self, exchange: &str, symbol: &str) -> Result<Option<SymbolRef>> {
        if let Some(sym) = self.symbols.get(exchange, symbol) {
            return Ok(Some(sym));
        }

        let row: Option<DbSymbol> =
            sqlx::query_as("SELECT id, exchange, symbol, price_tick, quote_asset FROM symbols WHERE exchange = ? AND symbol = ?")
                .bind(exchange)
                .bind(symbol)
                .fetch_optional(self.pool())
                .await?;

        Ok(row.map(|row| {
            let sym = SymbolRef {
                exchange: row.exchange,
                symbol: row.symbol,
                symbol_id: row.id,
                price_tick: row.price_tick,
                quote_asset: row.quote_asset,
            };
            self.symbols.put(sym.clone());
            sym
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let db = TimeSeriesStore::open(":memory:").await.unwrap();
        let a = db.register_symbol("binance", "BTC/USDT", 0.5, "USDT").await.unwrap();
        let b = db.register_symbol("binance", "BTC/USDT", 0.1, "USDT").await.unwrap();
        assert_eq!(a.symbol_id, b.symbol_id);
        assert_eq!(b.price_tick, 0.1);
    }

    #[tokio::test]
    async fn test_lookup_uses_cache_and_store() {
        let db = TimeSeriesStore::open(":memory:").await.unwrap();
        assert!(db.symbol_ref("binance", "BTC/USDT").await.unwrap().is_none());

        let registered = db.register_symbol("binance", "BTC/USDT", 0.5, "USDT").await.unwrap();
        let looked_up = db.symbol_ref("binance", "BTC/USDT").await.unwrap().unwrap();
        assert_eq!(looked_up, registered);
    }
}
