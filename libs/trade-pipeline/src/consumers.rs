//! Persistence consumers: one group per subscription kind.
//!
//! Each message is parsed, validated, written to the store (idempotent
//! upsert) and to the hot cache, and only then committed. Malformed
//! messages are dropped with a counter; store failures leave the offset
//! uncommitted and restart the consumer so the message is redelivered.

use std::time::Duration;

use hot_cache::MarketCache;
use market_bus::{Delivery, MessageBus};
use market_store::TimeSeriesStore;
use market_types::{topics, OrderBookSnapshot, SubscriptionKind, TickerSnapshot, TradeEvent};
use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::shutdown::ShutdownSignal;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

enum ProcessError {
    /// Bad message: drop (commit) and count.
    Reject(String),
    /// Store or cache failure: do not commit, resubscribe and redeliver.
    Retryable(String),
}

pub struct PersistenceConsumers {
    bus: MessageBus,
    store: TimeSeriesStore,
    cache: MarketCache,
    shutdown: ShutdownSignal,
}

impl PersistenceConsumers {
    pub fn new(
        bus: MessageBus,
        store: TimeSeriesStore,
        cache: MarketCache,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            bus,
            store,
            cache,
            shutdown,
        }
    }

    /// One task per kind; strictly sequential within a group.
    pub fn spawn(self) -> Vec<(&'static str, JoinHandle<()>)> {
        let kinds = [
            ("persist-orderbook", SubscriptionKind::Orderbook),
            ("persist-trades", SubscriptionKind::Trades),
            ("persist-ticker", SubscriptionKind::Ticker),
        ];
        kinds
            .into_iter()
            .map(|(name, kind)| {
                let bus = self.bus.clone();
                let store = self.store.clone();
                let cache = self.cache.clone();
                let shutdown = self.shutdown.clone();
                (
                    name,
                    tokio::spawn(run_consumer(name, kind, bus, store, cache, shutdown)),
                )
            })
            .collect()
    }
}

async fn run_consumer(
    group: &'static str,
    kind: SubscriptionKind,
    bus: MessageBus,
    store: TimeSeriesStore,
    cache: MarketCache,
    mut shutdown: ShutdownSignal,
) {
    let pattern = topics::market_data_pattern(kind);
    'resubscribe: loop {
        if shutdown.is_shutdown() {
            break;
        }
        let subscription = match bus.subscribe(group, &pattern) {
            Ok(subscription) => subscription,
            Err(err) => {
                warn!(group, error = %err, "cannot subscribe, consumer exiting");
                break;
            }
        };

        loop {
            let delivery = tokio::select! {
                _ = shutdown.cancelled() => break 'resubscribe,
                delivery = subscription.recv() => match delivery {
                    Some(delivery) => delivery,
                    None => break 'resubscribe,
                },
            };

            match process(kind, &delivery, &store, &cache).await {
                Ok(()) => subscription.commit(&delivery),
                Err(ProcessError::Reject(reason)) => {
                    warn!(group, topic = %delivery.topic, %reason, "rejecting malformed message");
                    counter!("persistence_rejected_total", 1, "topic" => delivery.topic.clone());
                    subscription.commit(&delivery);
                }
                Err(ProcessError::Retryable(reason)) => {
                    error!(group, topic = %delivery.topic, %reason, "store write failed, redelivering");
                    counter!("persistence_store_failures_total", 1, "topic" => delivery.topic.clone());
                    drop(subscription);
                    if !shutdown.sleep(RESUBSCRIBE_DELAY).await {
                        break 'resubscribe;
                    }
                    continue 'resubscribe;
                }
            }
        }
    }
    debug!(group, "persistence consumer exiting");
}

async fn process(
    kind: SubscriptionKind,
    delivery: &Delivery,
    store: &TimeSeriesStore,
    cache: &MarketCache,
) -> Result<(), ProcessError> {
    match kind {
        SubscriptionKind::Orderbook => {
            let book: OrderBookSnapshot = parse(&delivery.payload)?;
            book.validate().map_err(|e| ProcessError::Reject(e.to_string()))?;
            let symbol = resolve_symbol(store, &book.exchange, &book.symbol).await?;
            store
                .upsert_order_book(symbol, &book)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
            cache
                .put_order_book(&book)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
        }
        SubscriptionKind::Trades => {
            let trade: TradeEvent = parse(&delivery.payload)?;
            trade.validate().map_err(|e| ProcessError::Reject(e.to_string()))?;
            let symbol = resolve_symbol(store, &trade.exchange, &trade.symbol).await?;
            store
                .upsert_trade(symbol, &trade)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
            cache
                .push_trade(&trade)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
        }
        SubscriptionKind::Ticker => {
            let ticker: TickerSnapshot = parse(&delivery.payload)?;
            ticker.validate().map_err(|e| ProcessError::Reject(e.to_string()))?;
            let symbol = resolve_symbol(store, &ticker.exchange, &ticker.symbol).await?;
            store
                .upsert_mini_ticker(symbol, &ticker)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
            cache
                .put_ticker(&ticker)
                .await
                .map_err(|e| ProcessError::Retryable(e.to_string()))?;
        }
    }
    Ok(())
}

fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T, ProcessError> {
    serde_json::from_slice(payload).map_err(|e| ProcessError::Reject(e.to_string()))
}

async fn resolve_symbol(
    store: &TimeSeriesStore,
    exchange: &str,
    symbol: &str,
) -> Result<i64, ProcessError> {
    match store.symbol_ref(exchange, symbol).await {
        Ok(Some(sym)) => Ok(sym.symbol_id),
        Ok(None) => Err(ProcessError::Reject(format!("unregistered symbol {exchange}/{symbol}"))),
        Err(err) => Err(ProcessError::Retryable(err.to_string())),
    }
}
