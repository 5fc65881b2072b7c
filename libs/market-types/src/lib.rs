//! Shared domain model for the market-data-to-trade pipeline.
//!
//! Everything that crosses a component boundary lives here: market data
//! snapshots, footprint candles, trading signals, strategy instances and
//! placed orders, plus the bus topic naming scheme.

pub mod footprint;
pub mod market;
pub mod order;
pub mod signal;
pub mod strategy;
pub mod symbol;
pub mod topics;

pub use footprint::{FootprintCandle, PriceBucket};
pub use market::{AggressorSide, BookLevel, OrderBookSnapshot, TickerSnapshot, TradeEvent};
pub use order::{Fill, OrderKind, OrderSide, OrderStatus, PlacedOrder};
pub use signal::{OracleInsight, Pressure, TradingSignal};
pub use strategy::{StrategyInstance, StrategyParams, StrategyStatus};
pub use symbol::{bucket_index, bucket_price, topic_symbol, SymbolRef};
pub use topics::SubscriptionKind;

use thiserror::Error;

/// Validation failure for a domain object arriving off the wire.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("unknown strategy kind: {0}")]
    UnknownStrategyKind(String),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field,
        reason: reason.into(),
    }
}
