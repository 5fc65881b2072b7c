//! Row types mapped with sqlx.

use market_types::{
    FootprintCandle, OrderKind, OrderSide, OrderStatus, PlacedOrder, StrategyInstance,
    StrategyParams, StrategyStatus,
};
use sqlx::FromRow;

use crate::{Result, StoreError};

#[derive(Debug, Clone, FromRow)]
pub struct DbSymbol {
    pub id: i64,
    pub exchange: String,
    pub symbol: String,
    pub price_tick: f64,
    pub quote_asset: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DbFootprint {
    pub symbol_id: i64,
    pub exchange: String,
    pub symbol: String,
    pub start_time: i64,
    pub end_time: i64,
    pub open_price: f64,
    pub high_price: f64,
    pub low_price: f64,
    pub close_price: f64,
    pub total_volume: f64,
    pub total_delta: f64,
    pub poc_price: f64,
    pub value_area_high: f64,
    pub value_area_low: f64,
    pub footprint_data: String,
}

impl DbFootprint {
    pub fn into_candle(self, interval_ms: i64) -> Result<FootprintCandle> {
        Ok(FootprintCandle {
            exchange: self.exchange,
            symbol: self.symbol,
            symbol_id: self.symbol_id,
            interval_ms,
            start_time: self.start_time,
            end_time: self.end_time,
            open: self.open_price,
            high: self.high_price,
            low: self.low_price,
            close: self.close_price,
            total_volume: self.total_volume,
            total_delta: self.total_delta,
            poc_price: self.poc_price,
            value_area_high: self.value_area_high,
            value_area_low: self.value_area_low,
            buckets: serde_json::from_str(&self.footprint_data)?,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbStrategy {
    pub id: i64,
    pub owner_id: i64,
    pub exchange_config_id: i64,
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub params: String,
    pub desired_active: bool,
    pub status: String,
    pub health_message: Option<String>,
    pub last_eval_at: Option<i64>,
    pub consecutive_errors: i64,
    pub state: Option<String>,
}

impl DbStrategy {
    pub fn into_instance(self) -> Result<StrategyInstance> {
        let params = StrategyParams::from_json(&self.params)
            .map_err(|e| StoreError::InvalidRow(format!("strategy {}: {e}", self.id)))?;
        let status = StrategyStatus::parse(&self.status)
            .ok_or_else(|| StoreError::InvalidRow(format!("strategy {}: status '{}'", self.id, self.status)))?;
        let state = match self.state {
            Some(raw) => Some(serde_json::from_str(&raw)?),
            None => None,
        };
        Ok(StrategyInstance {
            id: self.id,
            owner_id: self.owner_id,
            exchange_config_id: self.exchange_config_id,
            name: self.name,
            exchange: self.exchange,
            symbol: self.symbol,
            params,
            desired_active: self.desired_active,
            status,
            health_message: self.health_message,
            last_eval_at: self.last_eval_at,
            consecutive_errors: self.consecutive_errors as u32,
            state,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbOrder {
    pub id: i64,
    pub strategy_id: i64,
    pub user_id: i64,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub exchange: String,
    pub symbol_id: i64,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub side: String,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub status: String,
    pub leverage: Option<i64>,
    pub margin_type: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DbOrder {
    pub fn into_order(self) -> Result<PlacedOrder> {
        let kind = match self.kind.as_str() {
            "market" => OrderKind::Market,
            "limit" => OrderKind::Limit,
            other => return Err(StoreError::InvalidRow(format!("order {}: type '{other}'", self.id))),
        };
        let side = match self.side.as_str() {
            "buy" => OrderSide::Buy,
            "sell" => OrderSide::Sell,
            other => return Err(StoreError::InvalidRow(format!("order {}: side '{other}'", self.id))),
        };
        let status = OrderStatus::parse(&self.status)
            .ok_or_else(|| StoreError::InvalidRow(format!("order {}: status '{}'", self.id, self.status)))?;
        Ok(PlacedOrder {
            id: self.id,
            strategy_id: self.strategy_id,
            user_id: self.user_id,
            client_order_id: self.client_order_id,
            exchange_order_id: self.exchange_order_id,
            exchange: self.exchange,
            symbol_id: self.symbol_id,
            kind,
            side,
            price: self.price,
            quantity: self.quantity,
            filled_quantity: self.filled_quantity,
            avg_fill_price: self.avg_fill_price,
            status,
            leverage: self.leverage.map(|l| l as u32),
            margin_type: self.margin_type,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct DbCredential {
    pub id: i64,
    pub owner_id: i64,
    pub exchange: String,
    pub testnet: bool,
    pub api_key: Vec<u8>,
    pub api_secret: Vec<u8>,
    pub passphrase: Option<Vec<u8>>,
    pub active: bool,
}
