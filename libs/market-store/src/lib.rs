//! Durable time-series store for market data and trade history.
//!
//! SQLite over sqlx, WAL mode, one pool per process. Every market-data
//! write is an upsert keyed so that replays are idempotent; retryable
//! errors (busy/locked/io) are retried up to three times before
//! surfacing.

pub mod credentials;
pub mod models;
pub mod orders;
pub mod schema;
pub mod strategies;
pub mod symbols;

use std::str::FromStr;

use market_types::{FootprintCandle, OrderBookSnapshot, TickerSnapshot, TradeEvent};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use thiserror::Error;
use tracing::info;

pub use orders::NewOrder;
pub use strategies::{LoadedStrategies, NewStrategy};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

pub(crate) fn is_retryable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let msg = db.message();
            msg.contains("locked") || msg.contains("busy")
        }
        _ => false,
    }
}

/// Re-evaluates the query expression on each attempt; up to 3 tries for
/// retryable failures.
macro_rules! retry_query {
    ($op:expr) => {{
        let mut attempt = 0u32;
        loop {
            match $op.await {
                Ok(value) => break Ok(value),
                Err(err) if crate::is_retryable(&err) && attempt < 2 => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %err, "retrying store query");
                    tokio::time::sleep(std::time::Duration::from_millis(50 << attempt)).await;
                }
                Err(err) => break Err(err),
            }
        }
    }};
}
pub(crate) use retry_query;

/// Durable store handle. Cheap to clone.
#[derive(Clone)]
pub struct TimeSeriesStore {
    pool: SqlitePool,
    symbols: symbols::SymbolRegistry,
}

impl TimeSeriesStore {
    /// Open (or create) the database at `path` and run the schema.
    /// `":memory:"` gives a private in-memory store for tests.
    pub async fn open(path: &str) -> Result<Self> {
        info!(path, "opening time-series store");
        let options = SqliteConnectOptions::from_str(path)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePool::connect_with(options).await?;
        schema::initialize_schema(&pool).await?;

        Ok(Self {
            pool,
            symbols: symbols::SymbolRegistry::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    // ==================== MARKET DATA ====================

    /// Upsert keyed `(time, symbol_id, exchange)`.
    pub async fn upsert_order_book(&self, symbol_id: i64, book: &OrderBookSnapshot) -> Result<()> {
        let bids = serde_json::to_string(&book.bids)?;
        let asks = serde_json::to_string(&book.asks)?;
        retry_query!(sqlx::query(
            r#"
            INSERT INTO order_books_futures (time, symbol_id, exchange, bids, asks)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (time, symbol_id, exchange)
            DO UPDATE SET bids = excluded.bids, asks = excluded.asks
            "#,
        )
        .bind(book.timestamp)
        .bind(symbol_id)
        .bind(&book.exchange)
        .bind(&bids)
        .bind(&asks)
        .execute(&self.pool))?;
        Ok(())
    }

    /// Idempotent on `(time, symbol_id, exchange, trade_id)`: replaying a
    /// stream leaves the row count unchanged.
    pub async fn upsert_trade(&self, symbol_id: i64, trade: &TradeEvent) -> Result<()> {
        retry_query!(sqlx::query(
            r#"
            INSERT OR IGNORE INTO trades_futures
                (time, symbol_id, exchange, trade_id, price, quantity, side, is_maker)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(trade.timestamp)
        .bind(symbol_id)
        .bind(&trade.exchange)
        .bind(&trade.trade_id)
        .bind(trade.price)
        .bind(trade.quantity)
        .bind(trade.side.as_str())
        .bind(trade.is_maker)
        .execute(&self.pool))?;
        Ok(())
    }

    /// Upsert keyed `(time, symbol_id, exchange)`.
    pub async fn upsert_mini_ticker(&self, symbol_id: i64, ticker: &TickerSnapshot) -> Result<()> {
        retry_query!(sqlx::query(
            r#"
            INSERT INTO mini_tickers_futures
                (time, symbol_id, exchange, open, high, low, close, volume, quote_volume)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (time, symbol_id, exchange)
            DO UPDATE SET open = excluded.open, high = excluded.high, low = excluded.low,
                          close = excluded.close, volume = excluded.volume,
                          quote_volume = excluded.quote_volume
            "#,
        )
        .bind(ticker.timestamp)
        .bind(symbol_id)
        .bind(&ticker.exchange)
        .bind(ticker.open)
        .bind(ticker.high)
        .bind(ticker.low)
        .bind(ticker.last)
        .bind(ticker.base_volume)
        .bind(ticker.quote_volume)
        .execute(&self.pool))?;
        Ok(())
    }

    /// Upsert keyed `(symbol_id, exchange, interval_type, start_time)` so
    /// re-emission of a finalized bar is harmless.
    pub async fn upsert_footprint(&self, candle: &FootprintCandle) -> Result<()> {
        let interval = FootprintCandle::interval_label(candle.interval_ms);
        let footprint_data = serde_json::to_string(&candle.buckets)?;
        retry_query!(sqlx::query(
            r#"
            INSERT INTO footprints_futures
                (symbol_id, exchange, interval_type, start_time, end_time,
                 open_price, high_price, low_price, close_price,
                 total_volume, total_delta, poc_price,
                 value_area_high, value_area_low, footprint_data)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (symbol_id, exchange, interval_type, start_time)
            DO UPDATE SET end_time = excluded.end_time,
                          open_price = excluded.open_price,
                          high_price = excluded.high_price,
                          low_price = excluded.low_price,
                          close_price = excluded.close_price,
                          total_volume = excluded.total_volume,
                          total_delta = excluded.total_delta,
                          poc_price = excluded.poc_price,
                          value_area_high = excluded.value_area_high,
                          value_area_low = excluded.value_area_low,
                          footprint_data = excluded.footprint_data
            "#,
        )
        .bind(candle.symbol_id)
        .bind(&candle.exchange)
        .bind(&interval)
        .bind(candle.start_time)
        .bind(candle.end_time)
        .bind(candle.open)
        .bind(candle.high)
        .bind(candle.low)
        .bind(candle.close)
        .bind(candle.total_volume)
        .bind(candle.total_delta)
        .bind(candle.poc_price)
        .bind(candle.value_area_high)
        .bind(candle.value_area_low)
        .bind(&footprint_data)
        .execute(&self.pool))?;
        Ok(())
    }

    /// Read a finalized bar back; used by reconciliation and tests.
    pub async fn footprint(
        &self,
        symbol_id: i64,
        exchange: &str,
        interval_ms: i64,
        start_time: i64,
    ) -> Result<Option<FootprintCandle>> {
        let interval = FootprintCandle::interval_label(interval_ms);
        let row: Option<models::DbFootprint> = sqlx::query_as(
            r#"
            SELECT f.symbol_id, f.exchange, f.interval_type, f.start_time, f.end_time,
                   f.open_price, f.high_price, f.low_price, f.close_price,
                   f.total_volume, f.total_delta, f.poc_price,
                   f.value_area_high, f.value_area_low, f.footprint_data,
                   s.symbol AS symbol
            FROM footprints_futures f
            JOIN symbols s ON s.id = f.symbol_id
            WHERE f.symbol_id = ? AND f.exchange = ? AND f.interval_type = ? AND f.start_time = ?
            "#,
        )
        .bind(symbol_id)
        .bind(exchange)
        .bind(&interval)
        .bind(start_time)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.into_candle(interval_ms)?)),
            None => Ok(None),
        }
    }

    pub async fn trade_count(&self, symbol_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM trades_futures WHERE symbol_id = ?")
                .bind(symbol_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn order_book_count(&self, symbol_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM order_books_futures WHERE symbol_id = ?")
                .bind(symbol_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    pub async fn ticker_count(&self, symbol_id: i64) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM mini_tickers_futures WHERE symbol_id = ?")
                .bind(symbol_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
