//! Order executor: consumes trading signals, applies risk policy, places
//! orders idempotently and records the results.
//!
//! The client-order-id is derived from the signal body, so a redelivered
//! signal can never place a second order; the offset is committed only
//! once placement succeeded or failed non-retryably.

use std::sync::Arc;
use std::time::Duration;

use exchange_core::{CredentialHandle, ExchangeError, OrderAck, OrderRequest};
use hot_cache::MarketCache;
use market_bus::{Delivery, MessageBus};
use market_store::{NewOrder, TimeSeriesStore};
use market_types::{Fill, OrderKind, StrategyStatus, TradingSignal};
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ExecutorConfig;
use crate::notify::Notifier;
use crate::risk::{RiskContext, RiskPolicy};
use crate::shutdown::ShutdownSignal;
use crate::AdapterRegistry;

const CONSUMER_GROUP: &str = "order-executor";
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

pub struct OrderExecutor {
    bus: MessageBus,
    store: TimeSeriesStore,
    cache: MarketCache,
    adapters: AdapterRegistry,
    risk: Arc<RiskPolicy>,
    notifier: Arc<dyn Notifier>,
    config: ExecutorConfig,
    shutdown: ShutdownSignal,
}

impl OrderExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bus: MessageBus,
        store: TimeSeriesStore,
        cache: MarketCache,
        adapters: AdapterRegistry,
        risk: Arc<RiskPolicy>,
        notifier: Arc<dyn Notifier>,
        config: ExecutorConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            bus,
            store,
            cache,
            adapters,
            risk,
            notifier,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut shutdown = self.shutdown.clone();
        'resubscribe: loop {
            if shutdown.is_shutdown() {
                break;
            }
            let subscription = match self.bus.subscribe(CONSUMER_GROUP, market_types::topics::TRADING_SIGNALS) {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(error = %err, "executor cannot subscribe, exiting");
                    break;
                }
            };

            loop {
                // in-flight placement always completes: shutdown is only
                // observed between messages
                let delivery = tokio::select! {
                    _ = shutdown.cancelled() => break 'resubscribe,
                    delivery = subscription.recv() => match delivery {
                        Some(delivery) => delivery,
                        None => break 'resubscribe,
                    },
                };
                self.handle_delivery(&delivery).await;
                subscription.commit(&delivery);
            }
        }
        debug!("order executor exiting");
    }

    async fn handle_delivery(&self, delivery: &Delivery) {
        let signal: TradingSignal = match serde_json::from_slice(&delivery.payload) {
            Ok(signal) => signal,
            Err(err) => {
                warn!(error = %err, "unparseable trading signal dropped");
                counter!("executor_rejected_total", 1);
                return;
            }
        };
        if let Err(err) = signal.validate() {
            warn!(strategy_id = signal.strategy_id, error = %err, "invalid trading signal dropped");
            counter!("executor_rejected_total", 1);
            return;
        }

        let client_order_id = client_order_id(&signal);

        match self.store.find_order_by_client_id(&client_order_id).await {
            Ok(Some(existing)) => {
                info!(
                    %client_order_id,
                    order_id = existing.id,
                    "duplicate client-order-id, signal already executed"
                );
                counter!("executor_duplicates_total", 1);
                return;
            }
            Ok(None) => {}
            Err(err) => {
                // cannot prove uniqueness; the adapter-side dedup still holds
                warn!(error = %err, "dedup lookup failed, relying on exchange dedup");
            }
        }

        let (amount, usd_value) = match self.size_order(&signal).await {
            Ok(sizing) => sizing,
            Err(reason) => {
                self.reject(&signal, &reason).await;
                return;
            }
        };

        let outcome = self
            .risk
            .pre_trade_check(&RiskContext {
                signal: &signal,
                usd_value,
                amount,
            })
            .await;
        if !outcome.passed {
            let reason = outcome.reason.unwrap_or_else(|| "risk check failed".into());
            counter!("risk_rejections_total", 1);
            self.reject(&signal, &reason).await;
            return;
        }

        let Some(adapter) = self.adapters.get(&signal.exchange) else {
            self.reject(&signal, &format!("no adapter for exchange '{}'", signal.exchange))
                .await;
            return;
        };

        let request = OrderRequest {
            symbol: signal.symbol.clone(),
            side: signal.side,
            kind: signal.kind,
            quantity: amount,
            price: signal.limit_price,
            client_order_id: client_order_id.clone(),
            leverage: signal.leverage,
        };
        let credential = CredentialHandle::new(signal.exchange_config_id);

        let ack = match self.place_with_retries(&*adapter, &credential, &request).await {
            Ok(ack) => ack,
            Err(err) => {
                counter!("orders_failed_total", 1);
                self.reject(&signal, &format!("order placement failed: {err}")).await;
                return;
            }
        };

        if let Err(err) = self.record(&signal, &request, &ack).await {
            // at-least-once: the row is keyed by exchange order id, a
            // redelivery after restart records it then
            error!(error = %err, exchange_order_id = %ack.exchange_order_id, "order recording failed");
        }
        counter!("orders_placed_total", 1);
    }

    /// Resolve base amount and estimated USD value per the signal shape.
    async fn size_order(&self, signal: &TradingSignal) -> Result<(f64, f64), String> {
        let last = match self.cache.ticker(&signal.exchange, &signal.symbol).await {
            Ok(Some(ticker)) => Some(ticker.last),
            _ => None,
        };

        if let Some(amount) = signal.amount {
            let usd = match signal.kind {
                OrderKind::Limit => signal.limit_price.unwrap_or(0.0) * amount,
                OrderKind::Market => last.map(|p| p * amount).unwrap_or(0.0),
            };
            return Ok((amount, usd));
        }

        let Some(quote) = signal.quote_amount else {
            return Err("signal carries neither amount nor quote amount".into());
        };
        let price = match signal.kind {
            OrderKind::Limit => signal.limit_price,
            OrderKind::Market => last,
        };
        match price {
            Some(price) if price > 0.0 => Ok((quote / price, quote)),
            _ => Err("cannot size quote-amount order without a price".into()),
        }
    }

    async fn place_with_retries(
        &self,
        adapter: &dyn exchange_core::ExchangeAdapter,
        credential: &CredentialHandle,
        request: &OrderRequest,
    ) -> Result<OrderAck, ExchangeError> {
        let retries = self.config.order_place_retries;
        let mut attempt = 0u32;
        loop {
            match adapter.create_order(credential, request).await {
                Ok(ack) => return Ok(ack),
                Err(ExchangeError::RateLimited { retry_after }) if attempt < retries => {
                    warn!(
                        client_order_id = %request.client_order_id,
                        ?retry_after,
                        "rate limited, backing off"
                    );
                    tokio::time::sleep(retry_after).await;
                    attempt += 1;
                }
                Err(ExchangeError::Transient(reason)) if attempt < retries => {
                    let backoff = RETRY_BASE_DELAY * 2u32.pow(attempt);
                    warn!(
                        client_order_id = %request.client_order_id,
                        %reason,
                        ?backoff,
                        "transient placement failure, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn record(
        &self,
        signal: &TradingSignal,
        request: &OrderRequest,
        ack: &OrderAck,
    ) -> anyhow::Result<()> {
        let symbol_id = match self.store.symbol_ref(&signal.exchange, &signal.symbol).await? {
            Some(sym) => sym.symbol_id,
            None => {
                warn!(symbol = %signal.symbol, "recording order for unregistered symbol");
                let quote = signal.symbol.split('/').nth(1).unwrap_or("USD").to_string();
                self.store
                    .register_symbol(&signal.exchange, &signal.symbol, 0.5, &quote)
                    .await?
                    .symbol_id
            }
        };

        let order_id = self
            .store
            .record_order(&NewOrder {
                strategy_id: signal.strategy_id,
                user_id: signal.owner_id,
                client_order_id: request.client_order_id.clone(),
                exchange_order_id: ack.exchange_order_id.clone(),
                exchange: signal.exchange.clone(),
                symbol_id,
                kind: signal.kind,
                side: signal.side,
                price: signal.limit_price,
                quantity: request.quantity,
                filled_quantity: ack.filled_quantity,
                avg_fill_price: ack.avg_fill_price,
                status: ack.status,
                leverage: signal.leverage,
                margin_type: None,
            })
            .await?;

        let fills = if !ack.fills.is_empty() {
            ack.fills
                .iter()
                .map(|fill| Fill {
                    bot_order_id: order_id,
                    user_id: signal.owner_id,
                    exchange: signal.exchange.clone(),
                    symbol_id,
                    side: signal.side,
                    trade_id: fill.trade_id.clone(),
                    price: fill.price,
                    quantity: fill.quantity,
                    fee: fill.fee,
                    fee_currency: fill.fee_currency.clone(),
                    transaction_time: fill.timestamp,
                })
                .collect()
        } else if ack.filled_quantity > 0.0 {
            // fully-filled single-trade fallback
            vec![Fill {
                bot_order_id: order_id,
                user_id: signal.owner_id,
                exchange: signal.exchange.clone(),
                symbol_id,
                side: signal.side,
                trade_id: format!("{}-fill", ack.exchange_order_id),
                price: ack.avg_fill_price.unwrap_or(0.0),
                quantity: ack.filled_quantity,
                fee: 0.0,
                fee_currency: String::new(),
                transaction_time: signal.timestamp,
            }]
        } else {
            Vec::new()
        };

        for fill in &fills {
            self.store.record_fill(fill).await?;
        }

        if let Ok(Some(order)) = self.store.find_order_by_client_id(&request.client_order_id).await {
            if let Err(err) = self.notifier.order_placed(&order).await {
                warn!(error = %err, "order notification failed");
            }
        }
        Ok(())
    }

    /// Terminal, non-retryable outcome for a signal: surface the reason on
    /// the strategy and acknowledge the message.
    async fn reject(&self, signal: &TradingSignal, reason: &str) {
        warn!(strategy_id = signal.strategy_id, %reason, "signal rejected");
        if let Err(err) = self
            .store
            .update_strategy_status(signal.strategy_id, StrategyStatus::Error, Some(reason))
            .await
        {
            warn!(error = %err, "cannot persist strategy health message");
        }
        if let Err(err) = self.notifier.order_failed(signal, reason).await {
            warn!(error = %err, "failure notification failed");
        }
    }
}

/// Deterministic client-order-id from the canonicalized signal body:
/// `(strategy id, timestamp, side, amount, limit price | market)`.
pub fn client_order_id(signal: &TradingSignal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signal.strategy_id.to_le_bytes());
    hasher.update(signal.timestamp.to_le_bytes());
    hasher.update(signal.side.as_str().as_bytes());
    if let Some(amount) = signal.amount {
        hasher.update(b"base");
        hasher.update(amount.to_le_bytes());
    }
    if let Some(quote) = signal.quote_amount {
        hasher.update(b"quote");
        hasher.update(quote.to_le_bytes());
    }
    match (signal.kind, signal.limit_price) {
        (OrderKind::Limit, Some(price)) => hasher.update(price.to_le_bytes()),
        _ => hasher.update(b"market"),
    }
    let digest = hex::encode(hasher.finalize());
    format!("tp-{}", &digest[..29])
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_types::OrderSide;

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
            state_digest: "d".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    #[test]
    fn test_client_order_id_is_deterministic() {
        assert_eq!(client_order_id(&signal()), client_order_id(&signal()));
        // 3-char prefix + 29 hex chars fits exchange id limits
        assert_eq!(client_order_id(&signal()).len(), 32);
    }

    #[test]
    fn test_client_order_id_varies_with_inputs() {
        let base = client_order_id(&signal());

        let mut different_amount = signal();
        different_amount.amount = Some(0.2);
        assert_ne!(base, client_order_id(&different_amount));

        let mut different_side = signal();
        different_side.side = OrderSide::Sell;
        assert_ne!(base, client_order_id(&different_side));

        let mut limit = signal();
        limit.kind = OrderKind::Limit;
        limit.limit_price = Some(100.5);
        assert_ne!(base, client_order_id(&limit));

        let mut different_ts = signal();
        different_ts.timestamp += 1;
        assert_ne!(base, client_order_id(&different_ts));
    }

    #[test]
    fn test_state_digest_not_part_of_dedup_key() {
        // two redeliveries of the same signal body must collide even if the
        // digest field was regenerated
        let mut a = signal();
        a.state_digest = "x".into();
        let mut b = signal();
        b.state_digest = "y".into();
        assert_eq!(client_order_id(&a), client_order_id(&b));
    }
}
