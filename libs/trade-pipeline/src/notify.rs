//! Optional notification hand-off after order placement. Failures are
//! logged and never abort the placement path.

use async_trait::async_trait;
use market_types::{PlacedOrder, TradingSignal};
use tracing::info;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn order_placed(&self, order: &PlacedOrder) -> anyhow::Result<()>;
    async fn order_failed(&self, signal: &TradingSignal, reason: &str) -> anyhow::Result<()>;
}

/// Default sink: structured logs only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn order_placed(&self, order: &PlacedOrder) -> anyhow::Result<()> {
        info!(
            order_id = order.id,
            exchange_order_id = %order.exchange_order_id,
            side = order.side.as_str(),
            quantity = order.quantity,
            status = order.status.as_str(),
            "order placed"
        );
        Ok(())
    }

    async fn order_failed(&self, signal: &TradingSignal, reason: &str) -> anyhow::Result<()> {
        info!(
            strategy_id = signal.strategy_id,
            symbol = %signal.symbol,
            %reason,
            "order failed"
        );
        Ok(())
    }
}
