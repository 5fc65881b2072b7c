//! Placed orders and their fills.
//!
//! Orders are deduplicated two ways: `client_order_id` is the executor's
//! idempotency key, `(exchange, exchange_order_id)` absorbs at-least-once
//! recording after a consumer restart.

use chrono::Utc;
use market_types::{Fill, OrderKind, OrderSide, OrderStatus, PlacedOrder};

use crate::models::DbOrder;
use crate::{retry_query, Result, TimeSeriesStore};

/// An order as it comes back from a successful exchange placement.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub strategy_id: i64,
    pub user_id: i64,
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub exchange: String,
    pub symbol_id: i64,
    pub kind: OrderKind,
    pub side: OrderSide,
    pub price: Option<f64>,
    pub quantity: f64,
    pub filled_quantity: f64,
    pub avg_fill_price: Option<f64>,
    pub status: OrderStatus,
    pub leverage: Option<u32>,
    pub margin_type: Option<String>,
}

const SELECT_COLUMNS: &str = "id, strategy_id, user_id, client_order_id, exchange_order_id, \
     exchange, symbol_id, type, side, price, quantity, filled_quantity, avg_fill_price, status, \
     leverage, margin_type, created_at, updated_at";

impl TimeSeriesStore {
    /// Record a placement; replaying the same exchange order updates the
    /// existing row. Returns the internal order id.
    pub async fn record_order(&self, new: &NewOrder) -> Result<i64> {
        let now = Utc::now().timestamp_millis();
        retry_query!(sqlx::query(
            r#"
            INSERT INTO bot_orders
                (strategy_id, user_id, client_order_id, exchange_order_id, exchange, symbol_id,
                 type, side, price, quantity, filled_quantity, avg_fill_price, status,
                 leverage, margin_type, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (exchange, exchange_order_id)
            DO UPDATE SET filled_quantity = excluded.filled_quantity,
                          avg_fill_price = excluded.avg_fill_price,
                          status = excluded.status,
                          updated_at = excluded.updated_at
            "#,
        )
        .bind(new.strategy_id)
        .bind(new.user_id)
        .bind(&new.client_order_id)
        .bind(&new.exchange_order_id)
        .bind(&new.exchange)
        .bind(new.symbol_id)
        .bind(new.kind.as_str())
        .bind(new.side.as_str())
        .bind(new.price)
        .bind(new.quantity)
        .bind(new.filled_quantity)
        .bind(new.avg_fill_price)
        .bind(new.status.as_str())
        .bind(new.leverage.map(|l| l as i64))
        .bind(&new.margin_type)
        .bind(now)
        .bind(now)
        .execute(self.pool()))?;

        let (id,): (i64,) = sqlx::query_as("SELECT id FROM bot_orders WHERE client_order_id = ?")
            .bind(&new.client_order_id)
            .fetch_one(self.pool())
            .await?;
        Ok(id)
    }

    pub async fn find_order_by_client_id(&self, client_order_id: &str) -> Result<Option<PlacedOrder>> {
        let row: Option<DbOrder> = sqlx::query_as(&format!(
            "SELECT {SELECT_COLUMNS} FROM bot_orders WHERE client_order_id = ?"
        ))
        .bind(client_order_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(DbOrder::into_order).transpose()
    }

    pub async fn update_order_fill(
        &self,
        id: i64,
        status: OrderStatus,
        filled_quantity: f64,
        avg_fill_price: Option<f64>,
    ) -> Result<()> {
        retry_query!(sqlx::query(
            "UPDATE bot_orders SET status = ?, filled_quantity = ?, avg_fill_price = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(filled_quantity)
        .bind(avg_fill_price)
        .bind(Utc::now().timestamp_millis())
        .bind(id)
        .execute(self.pool()))?;
        Ok(())
    }

    /// Idempotent on `(bot_order_id, trade_id)`.
    pub async fn record_fill(&self, fill: &Fill) -> Result<()> {
        retry_query!(sqlx::query(
            r#"
            INSERT OR IGNORE INTO bot_transactions
                (bot_order_id, user_id, exchange, symbol_id, side, trade_id,
                 price, quantity, fee, fee_currency, transaction_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(fill.bot_order_id)
        .bind(fill.user_id)
        .bind(&fill.exchange)
        .bind(fill.symbol_id)
        .bind(fill.side.as_str())
        .bind(&fill.trade_id)
        .bind(fill.price)
        .bind(fill.quantity)
        .bind(fill.fee)
        .bind(&fill.fee_currency)
        .bind(fill.transaction_time)
        .execute(self.pool()))?;
        Ok(())
    }

    /// Open notional for the user's risk cap: `quantity * price` over open
    /// orders (market orders carry their average fill price).
    pub async fn open_exposure_usd(&self, user_id: i64) -> Result<f64> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT SUM(quantity * COALESCE(price, avg_fill_price, 0))
            FROM bot_orders WHERE user_id = ? AND status = 'open'
            "#,
        )
        .bind(user_id)
        .fetch_one(self.pool())
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    pub async fn strategy_exposure_usd(&self, strategy_id: i64) -> Result<f64> {
        let (total,): (Option<f64>,) = sqlx::query_as(
            r#"
            SELECT SUM(quantity * COALESCE(price, avg_fill_price, 0))
            FROM bot_orders WHERE strategy_id = ? AND status = 'open'
            "#,
        )
        .bind(strategy_id)
        .fetch_one(self.pool())
        .await?;
        Ok(total.unwrap_or(0.0))
    }

    pub async fn order_count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bot_orders")
            .fetch_one(self.pool())
            .await?;
        Ok(count)
    }

    pub async fn fills_for_order(&self, bot_order_id: i64) -> Result<Vec<Fill>> {
        #[derive(sqlx::FromRow)]
        struct Row {
            bot_order_id: i64,
            user_id: i64,
            exchange: String,
            symbol_id: i64,
            side: String,
            trade_id: String,
            price: f64,
            quantity: f64,
            fee: f64,
            fee_currency: String,
            transaction_time: i64,
        }

        let rows: Vec<Row> = sqlx::query_as(
            r#"
            SELECT bot_order_id, user_id, exchange, symbol_id, side, trade_id,
                   price, quantity, fee, fee_currency, transaction_time
            FROM bot_transactions WHERE bot_order_id = ? ORDER BY transaction_time
            "#,
        )
        .bind(bot_order_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Fill {
                bot_order_id: r.bot_order_id,
                user_id: r.user_id,
                exchange: r.exchange,
                symbol_id: r.symbol_id,
                side: if r.side == "sell" { OrderSide::Sell } else { OrderSide::Buy },
                trade_id: r.trade_id,
                price: r.price,
                quantity: r.quantity,
                fee: r.fee,
                fee_currency: r.fee_currency,
                transaction_time: r.transaction_time,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_order(client_id: &str, exchange_order_id: &str) -> NewOrder {
        NewOrder {
            strategy_id: 7,
            user_id: 3,
            client_order_id: client_id.into(),
            exchange_order_id: exchange_order_id.into(),
            exchange: "binance".into(),
            symbol_id: 1,
            kind: OrderKind::Market,
            side: OrderSide::Buy,
            price: None,
            quantity: 0.1,
            filled_quantity: 0.1,
            avg_fill_price: Some(100.5),
            status: OrderStatus::Closed,
            leverage: None,
            margin_type: None,
        }
    }

    #[tokio::test]
    async fn test_record_order_dedups_by_exchange_id() {
        let db = TimeSeriesStore::open(":memory:").await.unwrap();
        let a = db.record_order(&new_order("c-1", "x-1")).await.unwrap();
        let b = db.record_order(&new_order("c-1", "x-1")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(db.order_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_fill_dedup_and_lookup() {
        let db = TimeSeriesStore::open(":memory:").await.unwrap();
        let order_id = db.record_order(&new_order("c-1", "x-1")).await.unwrap();

        let fill = Fill {
            bot_order_id: order_id,
            user_id: 3,
            exchange: "binance".into(),
            symbol_id: 1,
            side: OrderSide::Buy,
            trade_id: "t-1".into(),
            price: 100.5,
            quantity: 0.1,
            fee: 0.01,
            fee_currency: "USDT".into(),
            transaction_time: 1_700_000_000_000,
        };
        db.record_fill(&fill).await.unwrap();
        db.record_fill(&fill).await.unwrap();

        let fills = db.fills_for_order(order_id).await.unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0], fill);

        let order = db.find_order_by_client_id("c-1").await.unwrap().unwrap();
        assert_eq!(order.exchange_order_id, "x-1");
        assert_eq!(order.status, OrderStatus::Closed);
    }

    #[tokio::test]
    async fn test_exposure_sums_open_orders_only() {
        let db = TimeSeriesStore::open(":memory:").await.unwrap();

        let mut open = new_order("c-open", "x-open");
        open.status = OrderStatus::Open;
        open.kind = OrderKind::Limit;
        open.price = Some(100.0);
        open.quantity = 2.0;
        db.record_order(&open).await.unwrap();

        // closed order does not count
        db.record_order(&new_order("c-closed", "x-closed")).await.unwrap();

        assert_eq!(db.open_exposure_usd(3).await.unwrap(), 200.0);
        assert_eq!(db.strategy_exposure_usd(7).await.unwrap(), 200.0);
        assert_eq!(db.open_exposure_usd(99).await.unwrap(), 0.0);
    }
}
