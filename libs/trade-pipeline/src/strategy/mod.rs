//! Strategy engine: a manager loop reconciling desired state with
//! running evaluation tasks, one task per instance.
//!
//! The owner controls `desired_active`; the engine owns runtime status.
//! An errored instance is only rearmed by flipping desired-active off
//! and on again; hitting the consecutive-error budget auto-disables it.

pub mod kinds;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hot_cache::MarketCache;
use market_bus::MessageBus;
use market_store::TimeSeriesStore;
use market_types::{
    topic_symbol, topics, OrderKind, StrategyInstance, StrategyStatus, TradingSignal,
};
use metrics::counter;
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::StrategyConfig;
use crate::shutdown::ShutdownSignal;
use kinds::{EvalContext, Evaluation};

struct InstanceShared {
    /// Held for the whole evaluation to serialize concurrent triggers.
    instance: tokio::sync::Mutex<StrategyInstance>,
}

struct RunningInstance {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
    shared: Arc<InstanceShared>,
}

pub struct StrategyEngine {
    store: TimeSeriesStore,
    cache: MarketCache,
    bus: MessageBus,
    config: StrategyConfig,
    shutdown: ShutdownSignal,
}

impl StrategyEngine {
    pub fn new(
        store: TimeSeriesStore,
        cache: MarketCache,
        bus: MessageBus,
        config: StrategyConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            store,
            cache,
            bus,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let manager_interval = Duration::from_millis(self.config.manager_interval_ms);
        let mut shutdown = self.shutdown.clone();
        let mut running: HashMap<i64, RunningInstance> = HashMap::new();

        loop {
            self.reconcile(&mut running).await;
            if !shutdown.sleep(manager_interval).await {
                break;
            }
        }

        // statuses stay as persisted; a restart resumes running instances
        for (id, instance) in running.drain() {
            debug!(strategy_id = id, "cancelling evaluation task");
            let _ = instance.cancel.send(true);
            let _ = instance.handle.await;
        }
        debug!("strategy engine exiting");
    }

    async fn reconcile(&self, running: &mut HashMap<i64, RunningInstance>) {
        let loaded = match self.store.load_engine_strategies().await {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(error = %err, "strategy load failed, keeping current set");
                return;
            }
        };

        for (id, reason) in &loaded.rejected {
            let _ = self
                .store
                .update_strategy_status(*id, StrategyStatus::Error, Some(reason.as_str()))
                .await;
        }

        let loaded_ids: HashSet<i64> = loaded.ready.iter().map(|i| i.id).collect();
        let gone: Vec<i64> = running.keys().filter(|id| !loaded_ids.contains(id)).copied().collect();
        for id in gone {
            self.stop_instance(running, id).await;
        }

        for instance in loaded.ready {
            let id = instance.id;

            if !instance.desired_active {
                if running.contains_key(&id) {
                    self.stop_instance(running, id).await;
                    let _ = self
                        .store
                        .update_strategy_status(id, StrategyStatus::Stopped, None)
                        .await;
                } else if instance.status == StrategyStatus::Error {
                    // flipping desired-active off rearms an errored instance
                    let _ = self
                        .store
                        .update_strategy_status(id, StrategyStatus::PendingStart, instance.health_message.as_deref())
                        .await;
                } else if instance.status == StrategyStatus::Running {
                    // stale row from an earlier engine process
                    let _ = self
                        .store
                        .update_strategy_status(id, StrategyStatus::Stopped, None)
                        .await;
                }
                continue;
            }

            match running.get(&id) {
                Some(entry) => {
                    // refresh owner-controlled configuration
                    let mut current = entry.shared.instance.lock().await;
                    if current.params != instance.params {
                        info!(strategy_id = id, "refreshing strategy parameters");
                        current.params = instance.params;
                    }
                }
                None => {
                    if instance.status == StrategyStatus::Error {
                        // stays down until desired-active is cycled
                        continue;
                    }
                    self.start_instance(running, instance).await;
                }
            }
        }
    }

    async fn start_instance(&self, running: &mut HashMap<i64, RunningInstance>, mut instance: StrategyInstance) {
        let id = instance.id;
        info!(strategy_id = id, name = %instance.name, symbol = %instance.symbol, "starting strategy");
        instance.status = StrategyStatus::Running;
        instance.consecutive_errors = 0;
        if let Err(err) = self
            .store
            .update_strategy_status(id, StrategyStatus::Running, None)
            .await
        {
            warn!(strategy_id = id, error = %err, "cannot persist running status");
            return;
        }

        let shared = Arc::new(InstanceShared {
            instance: tokio::sync::Mutex::new(instance),
        });
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = tokio::spawn(eval_loop(
            Arc::clone(&shared),
            self.store.clone(),
            self.cache.clone(),
            self.bus.clone(),
            self.config.clone(),
            cancel_rx,
            self.shutdown.clone(),
        ));
        running.insert(
            id,
            RunningInstance {
                cancel: cancel_tx,
                handle,
                shared,
            },
        );
    }

    async fn stop_instance(&self, running: &mut HashMap<i64, RunningInstance>, id: i64) {
        if let Some(entry) = running.remove(&id) {
            info!(strategy_id = id, "stopping strategy");
            let _ = entry.cancel.send(true);
            let _ = entry.handle.await;
        }
    }
}

async fn eval_loop(
    shared: Arc<InstanceShared>,
    store: TimeSeriesStore,
    cache: MarketCache,
    bus: MessageBus,
    config: StrategyConfig,
    mut cancel: watch::Receiver<bool>,
    mut shutdown: ShutdownSignal,
) {
    let interval = Duration::from_millis(config.eval_interval_ms);
    loop {
        let disabled = {
            let mut instance = shared.instance.lock().await;
            evaluate_once(&mut instance, &store, &cache, &bus, config.max_consecutive_errors).await
        };
        if disabled {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    break;
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
}

/// One evaluation. Returns true when the instance auto-disabled itself.
async fn evaluate_once(
    instance: &mut StrategyInstance,
    store: &TimeSeriesStore,
    cache: &MarketCache,
    bus: &MessageBus,
    max_consecutive_errors: u32,
) -> bool {
    let now = chrono::Utc::now().timestamp_millis();

    let ctx = match fetch_context(cache, &instance.exchange, &instance.symbol).await {
        Ok(ctx) => ctx,
        Err(err) => {
            // cache trouble is not the strategy's fault; skip this tick
            warn!(strategy_id = instance.id, error = %err, "cache read failed, skipping evaluation");
            return false;
        }
    };

    let outcome = kinds::evaluate(&instance.params, &ctx).and_then(|evaluation| {
        if let Evaluation::Trade { side, amount, stop_loss, take_profit } = &evaluation {
            let signal = build_signal(instance, *side, *amount, *stop_loss, *take_profit, now);
            let payload = serde_json::to_vec(&signal).map_err(|e| e.to_string())?;
            bus.publish(topics::TRADING_SIGNALS, &topic_symbol(&signal.symbol), payload)
                .map_err(|e| e.to_string())?;
            counter!("strategy_signals_total", 1, "strategy" => instance.id.to_string());
            info!(
                strategy_id = instance.id,
                side = signal.side.as_str(),
                amount = amount,
                "trading signal emitted"
            );
        }
        Ok(evaluation)
    });

    match outcome {
        Ok(Evaluation::Skipped) => {
            debug!(strategy_id = instance.id, "market data missing, evaluation skipped");
            false
        }
        Ok(_) => {
            instance.consecutive_errors = 0;
            instance.last_eval_at = Some(now);
            if instance.status != StrategyStatus::Running {
                instance.status = StrategyStatus::Running;
                let _ = store
                    .update_strategy_status(instance.id, StrategyStatus::Running, None)
                    .await;
            }
            let _ = store.record_evaluation(instance.id, now, 0).await;
            false
        }
        Err(message) => {
            instance.consecutive_errors += 1;
            instance.last_eval_at = Some(now);
            instance.status = StrategyStatus::Error;
            counter!("strategy_eval_errors_total", 1, "strategy" => instance.id.to_string());
            warn!(
                strategy_id = instance.id,
                errors = instance.consecutive_errors,
                %message,
                "strategy evaluation failed"
            );
            let _ = store
                .update_strategy_status(instance.id, StrategyStatus::Error, Some(&message))
                .await;
            let _ = store
                .record_evaluation(instance.id, now, instance.consecutive_errors)
                .await;

            if instance.consecutive_errors >= max_consecutive_errors {
                let reason = format!(
                    "auto-disabled after {} consecutive evaluation failures: {message}",
                    instance.consecutive_errors
                );
                warn!(strategy_id = instance.id, %reason, "strategy auto-disabled");
                instance.status = StrategyStatus::Stopped;
                let _ = store
                    .update_strategy_status(instance.id, StrategyStatus::Stopped, Some(&reason))
                    .await;
                let _ = store.set_desired_active(instance.id, false).await;
                return true;
            }
            false
        }
    }
}

async fn fetch_context(
    cache: &MarketCache,
    exchange: &str,
    symbol: &str,
) -> Result<EvalContext, hot_cache::CacheError> {
    Ok(EvalContext {
        order_book: cache.order_book(exchange, symbol).await?,
        recent_trades: cache.recent_trades(exchange, symbol).await?,
        ticker: cache.ticker(exchange, symbol).await?,
    })
}

fn build_signal(
    instance: &StrategyInstance,
    side: market_types::OrderSide,
    amount: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    timestamp: i64,
) -> TradingSignal {
    TradingSignal {
        strategy_id: instance.id,
        owner_id: instance.owner_id,
        exchange_config_id: instance.exchange_config_id,
        exchange: instance.exchange.clone(),
        symbol: instance.symbol.clone(),
        side,
        kind: OrderKind::Market,
        amount: Some(amount),
        quote_amount: None,
        limit_price: None,
        stop_loss,
        take_profit,
        leverage: None,
        state_digest: state_digest(instance, side, amount, timestamp),
        timestamp,
    }
}

/// Digest of the state that produced the signal; the exactly-once key
/// per `(strategy_id, state_digest)`.
fn state_digest(
    instance: &StrategyInstance,
    side: market_types::OrderSide,
    amount: f64,
    timestamp: i64,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(instance.id.to_le_bytes());
    hasher.update(side.as_str().as_bytes());
    hasher.update(amount.to_le_bytes());
    hasher.update(timestamp.to_le_bytes());
    if let Some(state) = &instance.state {
        hasher.update(state.to_string().as_bytes());
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use market_types::{OrderSide, StrategyParams};

    fn instance() -> StrategyInstance {
        StrategyInstance {
            id: 7,
            owner_id: 3,
            exchange_config_id: 1,
            name: "imbalance".into(),
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            params: StrategyParams::OrderbookImbalance {
                depth: 5,
                buy_threshold: 0.65,
                sell_threshold: 0.35,
                order_size: 0.1,
            },
            desired_active: true,
            status: StrategyStatus::Running,
            health_message: None,
            last_eval_at: None,
            consecutive_errors: 0,
            state: None,
        }
    }

    #[test]
    fn test_state_digest_is_deterministic_per_inputs() {
        let inst = instance();
        let a = state_digest(&inst, OrderSide::Buy, 0.1, 1_700_000_000_000);
        let b = state_digest(&inst, OrderSide::Buy, 0.1, 1_700_000_000_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = state_digest(&inst, OrderSide::Sell, 0.1, 1_700_000_000_000);
        assert_ne!(a, c);
        let d = state_digest(&inst, OrderSide::Buy, 0.1, 1_700_000_000_001);
        assert_ne!(a, d);
    }

    #[test]
    fn test_build_signal_is_valid() {
        let signal = build_signal(&instance(), OrderSide::Buy, 0.1, None, None, 1_700_000_000_000);
        assert!(signal.validate().is_ok());
        assert_eq!(signal.kind, OrderKind::Market);
        assert_eq!(signal.amount, Some(0.1));
    }
}
