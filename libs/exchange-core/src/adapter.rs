//! The `ExchangeAdapter` trait and its error taxonomy.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use market_types::{OrderBookSnapshot, OrderKind, OrderSide, OrderStatus, TickerSnapshot, TradeEvent};

use crate::credentials::CredentialHandle;

/// Failure modes surfaced by every adapter call. The executor's retry
/// policy branches on these, so the mapping from raw exchange errors
/// matters more than the message text.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ExchangeError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    #[error("invalid order: {0}")]
    InvalidOrder(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ExchangeError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExchangeError::Transient(_) | ExchangeError::RateLimited { .. })
    }
}

/// Lazy, potentially infinite sequence of market data items. Dropping the
/// stream closes the underlying subscription.
pub type WatchStream<T> = Pin<Box<dyn Stream<Item = crate::Result<T>> + Send>>;

/// Static reference data for one tradable market.
#[derive(Debug, Clone)]
pub struct MarketInfo {
    pub symbol: String,
    pub price_tick: f64,
    pub quote_asset: String,
}

#[derive(Debug, Clone, Default)]
pub struct AccountBalance {
    /// Free balance per asset.
    pub assets: std::collections::HashMap<String, f64>,
}

/// Order placement request. `client_order_id` is the caller-supplied
/// idempotency key; adapters forward it and deduplicate retries within
/// their window.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub kind: OrderKind,
    pub quantity: f64,
    pub price: Option<f64>,
    pub client_order_id: String,
    pub leverage: Option<u32>,
}

/// One execution reported with a placement or order lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FillEvent {
    pub trade_id: String,
    pub price: f64,
    pub quantity: f64,
    pub fee: f64,
    pub fee_currency: String,
    pub timestamp: i64,
}

/// Exchange response to a placement or order lookup.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub client_order_id: String,
    pub status: OrderStatus,
    pub requested_quantity: f64,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub fills: Vec<FillEvent>,
}

/// Polymorphic exchange surface. Public market data needs no credential;
/// trading calls take a handle that is resolved and decrypted internally.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Lowercase exchange id, e.g. `binance`.
    fn exchange_id(&self) -> &str;

    async fn fetch_markets(&self) -> crate::Result<Vec<MarketInfo>>;

    async fn fetch_ticker(&self, symbol: &str) -> crate::Result<TickerSnapshot>;

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> crate::Result<OrderBookSnapshot>;

    async fn fetch_balance(&self, credential: &CredentialHandle) -> crate::Result<AccountBalance>;

    async fn create_order(
        &self,
        credential: &CredentialHandle,
        request: &OrderRequest,
    ) -> crate::Result<OrderAck>;

    async fn fetch_order(
        &self,
        credential: &CredentialHandle,
        symbol: &str,
        exchange_order_id: &str,
    ) -> crate::Result<OrderAck>;

    async fn cancel_order(
        &self,
        credential: &CredentialHandle,
        symbol: &str,
        exchange_order_id: &str,
    ) -> crate::Result<()>;

    async fn watch_order_book(&self, symbol: &str) -> crate::Result<WatchStream<OrderBookSnapshot>>;

    async fn watch_trades(&self, symbol: &str) -> crate::Result<WatchStream<TradeEvent>>;

    async fn watch_ticker(&self, symbol: &str) -> crate::Result<WatchStream<TickerSnapshot>>;
}
