//! Market data feed: one supervised watch loop per (exchange, symbol,
//! kind), publishing domain objects as JSON onto the bus.
//!
//! Transient stream errors restart the loop after the reconnect delay; a
//! `Fatal` from the adapter deactivates the subscription for good. A
//! separate health checker force-restarts loops that have gone quiet.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use exchange_core::{ExchangeAdapter, ExchangeError, WatchStream};
use futures::StreamExt;
use market_bus::MessageBus;
use market_types::{topic_symbol, topics, SubscriptionKind};
use metrics::counter;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::FeedConfig;
use crate::shutdown::ShutdownSignal;
use crate::AdapterRegistry;

#[derive(Error, Debug)]
pub enum FeedError {
    #[error("no adapter for exchange '{0}'")]
    UnknownExchange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub exchange: String,
    pub symbol: String,
    pub kind: SubscriptionKind,
}

/// Introspection row for `list_subscriptions`.
#[derive(Debug, Clone)]
pub struct SubscriptionStatus {
    pub exchange: String,
    pub symbol: String,
    pub kind: SubscriptionKind,
    pub active: bool,
    pub last_activity_ms: Option<i64>,
    pub last_error: Option<String>,
    pub restarts: u64,
}

struct SubscriptionShared {
    active: AtomicBool,
    last_activity_ms: AtomicI64,
    restarts: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SubscriptionShared {
    fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
            last_activity_ms: AtomicI64::new(chrono::Utc::now().timestamp_millis()),
            restarts: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(chrono::Utc::now().timestamp_millis(), Ordering::Release);
    }

    fn record_error(&self, error: impl Into<String>) {
        *self.last_error.lock() = Some(error.into());
    }
}

struct SubscriptionEntry {
    shared: Arc<SubscriptionShared>,
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct MarketDataFeed {
    bus: MessageBus,
    adapters: AdapterRegistry,
    config: FeedConfig,
    shutdown: ShutdownSignal,
    subscriptions: DashMap<SubscriptionKey, SubscriptionEntry>,
}

impl MarketDataFeed {
    pub fn new(
        bus: MessageBus,
        adapters: AdapterRegistry,
        config: FeedConfig,
        shutdown: ShutdownSignal,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            adapters,
            config,
            shutdown,
            subscriptions: DashMap::new(),
        })
    }

    /// Idempotent: a second add of the same key is a no-op; `active=false`
    /// tears an existing subscription down.
    pub fn add_subscription(
        self: &Arc<Self>,
        exchange: &str,
        symbol: &str,
        kind: SubscriptionKind,
        active: bool,
    ) -> Result<(), FeedError> {
        let key = SubscriptionKey {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            kind,
        };

        if !active {
            if let Some((_, entry)) = self.subscriptions.remove(&key) {
                info!(exchange, symbol, %kind, "tearing down subscription");
                let _ = entry.stop_tx.send(true);
                entry.shared.active.store(false, Ordering::Release);
            }
            return Ok(());
        }

        if self.subscriptions.contains_key(&key) {
            debug!(exchange, symbol, %kind, "subscription already present");
            return Ok(());
        }

        let adapter = self
            .adapters
            .get(exchange)
            .ok_or_else(|| FeedError::UnknownExchange(exchange.to_string()))?;

        let entry = self.spawn_watch(&key, adapter);
        info!(exchange, symbol, %kind, "subscription started");
        self.subscriptions.insert(key, entry);
        Ok(())
    }

    pub fn list_subscriptions(&self) -> Vec<SubscriptionStatus> {
        self.subscriptions
            .iter()
            .map(|entry| {
                let shared = &entry.value().shared;
                SubscriptionStatus {
                    exchange: entry.key().exchange.clone(),
                    symbol: entry.key().symbol.clone(),
                    kind: entry.key().kind,
                    active: shared.active.load(Ordering::Acquire),
                    last_activity_ms: Some(shared.last_activity_ms.load(Ordering::Acquire)),
                    last_error: shared.last_error.lock().clone(),
                    restarts: shared.restarts.load(Ordering::Acquire),
                }
            })
            .collect()
    }

    /// Spawn the stale-loop health checker; runs until shutdown.
    pub fn spawn_health_checker(self: &Arc<Self>) -> JoinHandle<()> {
        let feed = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let check_interval = Duration::from_millis(self.config.connection_check_interval_ms);
        tokio::spawn(async move {
            loop {
                if !shutdown.sleep(check_interval).await {
                    break;
                }
                feed.restart_stale(2 * check_interval.as_millis() as i64);
            }
            debug!("feed health checker exiting");
        })
    }

    fn restart_stale(self: &Arc<Self>, stale_after_ms: i64) {
        let now = chrono::Utc::now().timestamp_millis();
        let stale: Vec<SubscriptionKey> = self
            .subscriptions
            .iter()
            .filter(|entry| {
                let shared = &entry.value().shared;
                shared.active.load(Ordering::Acquire)
                    && now - shared.last_activity_ms.load(Ordering::Acquire) > stale_after_ms
            })
            .map(|entry| entry.key().clone())
            .collect();

        for key in stale {
            warn!(
                exchange = %key.exchange,
                symbol = %key.symbol,
                kind = %key.kind,
                "no activity on subscription, forcing restart"
            );
            counter!("feed_forced_restarts_total", 1);
            if let Some((_, old)) = self.subscriptions.remove(&key) {
                let _ = old.stop_tx.send(true);
                old.handle.abort();
                let restarts = old.shared.restarts.load(Ordering::Acquire);
                if let Some(adapter) = self.adapters.get(&key.exchange) {
                    let entry = self.spawn_watch(&key, adapter);
                    entry.shared.restarts.store(restarts + 1, Ordering::Release);
                    self.subscriptions.insert(key, entry);
                }
            }
        }
    }

    /// Stop every watch loop; called by the app during shutdown.
    pub fn stop_all(&self) {
        for entry in self.subscriptions.iter() {
            let _ = entry.value().stop_tx.send(true);
        }
    }

    fn spawn_watch(
        self: &Arc<Self>,
        key: &SubscriptionKey,
        adapter: Arc<dyn ExchangeAdapter>,
    ) -> SubscriptionEntry {
        let shared = Arc::new(SubscriptionShared::new());
        let (stop_tx, stop_rx) = watch::channel(false);

        let handle = match key.kind {
            SubscriptionKind::Orderbook => {
                let symbol = key.symbol.clone();
                self.spawn_typed(key, shared.clone(), stop_rx, move || {
                    let adapter = Arc::clone(&adapter);
                    let symbol = symbol.clone();
                    async move { adapter.watch_order_book(&symbol).await }
                })
            }
            SubscriptionKind::Trades => {
                let symbol = key.symbol.clone();
                self.spawn_typed(key, shared.clone(), stop_rx, move || {
                    let adapter = Arc::clone(&adapter);
                    let symbol = symbol.clone();
                    async move { adapter.watch_trades(&symbol).await }
                })
            }
            SubscriptionKind::Ticker => {
                let symbol = key.symbol.clone();
                self.spawn_typed(key, shared.clone(), stop_rx, move || {
                    let adapter = Arc::clone(&adapter);
                    let symbol = symbol.clone();
                    async move { adapter.watch_ticker(&symbol).await }
                })
            }
        };

        SubscriptionEntry {
            shared,
            stop_tx,
            handle,
        }
    }

    fn spawn_typed<T, W, Fut>(
        self: &Arc<Self>,
        key: &SubscriptionKey,
        shared: Arc<SubscriptionShared>,
        stop_rx: watch::Receiver<bool>,
        watch: W,
    ) -> JoinHandle<()>
    where
        T: Serialize + Send + Sync + 'static,
        W: Fn() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = exchange_core::Result<WatchStream<T>>> + Send + 'static,
    {
        let bus = self.bus.clone();
        let config = self.config.clone();
        let shutdown = self.shutdown.clone();
        let topic = topics::market_data(&key.exchange, &key.symbol, key.kind);
        let partition_key = topic_symbol(&key.symbol);
        tokio::spawn(run_watch_loop(
            topic,
            partition_key,
            bus,
            config,
            shared,
            shutdown,
            stop_rx,
            watch,
        ))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_watch_loop<T, W, Fut>(
    topic: String,
    partition_key: String,
    bus: MessageBus,
    config: FeedConfig,
    shared: Arc<SubscriptionShared>,
    mut shutdown: ShutdownSignal,
    mut stop_rx: watch::Receiver<bool>,
    watch: W,
) where
    T: Serialize + Send + Sync + 'static,
    W: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = exchange_core::Result<WatchStream<T>>> + Send + 'static,
{
    let reconnect_delay = Duration::from_millis(config.reconnect_delay_ms);

    'supervise: loop {
        if *stop_rx.borrow() || shutdown.is_shutdown() {
            break;
        }

        match watch().await {
            Ok(mut stream) => loop {
                tokio::select! {
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break 'supervise;
                        }
                    }
                    _ = shutdown.cancelled() => break 'supervise,
                    item = stream.next() => match item {
                        Some(Ok(object)) => {
                            shared.touch();
                            publish_with_retry(&bus, &topic, &partition_key, &object, config.publish_retry_limit).await;
                        }
                        Some(Err(ExchangeError::Fatal(reason))) => {
                            error!(%topic, %reason, "fatal feed error, stopping subscription");
                            shared.record_error(format!("fatal: {reason}"));
                            shared.active.store(false, Ordering::Release);
                            break 'supervise;
                        }
                        Some(Err(err)) => {
                            warn!(%topic, error = %err, "stream error, will reconnect");
                            shared.record_error(err.to_string());
                            break;
                        }
                        None => {
                            warn!(%topic, "stream ended, will reconnect");
                            shared.record_error("stream ended");
                            break;
                        }
                    }
                }
            },
            Err(ExchangeError::Fatal(reason)) => {
                error!(%topic, %reason, "fatal connect error, stopping subscription");
                shared.record_error(format!("fatal: {reason}"));
                shared.active.store(false, Ordering::Release);
                break;
            }
            Err(err) => {
                warn!(%topic, error = %err, "connect failed, will retry");
                shared.record_error(err.to_string());
            }
        }

        // session handle is closed (stream dropped); wait then restart
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {
                shared.restarts.fetch_add(1, Ordering::AcqRel);
            }
            _ = shutdown.cancelled() => break,
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
        }
    }
    debug!(%topic, "watch loop exiting");
}

/// Bounded-retry publication with exponential backoff and jitter; a
/// message that still cannot be published is dropped with a counter.
async fn publish_with_retry<T: Serialize>(
    bus: &MessageBus,
    topic: &str,
    key: &str,
    object: &T,
    retry_limit: u32,
) {
    let payload = match serde_json::to_vec(object) {
        Ok(payload) => payload,
        Err(err) => {
            error!(topic, error = %err, "unserializable feed object dropped");
            counter!("bus_publish_failures_total", 1, "topic" => topic.to_string());
            return;
        }
    };

    for attempt in 0..=retry_limit {
        match bus.publish(topic, key, payload.clone()) {
            Ok(_) => return,
            Err(err) => {
                if attempt == retry_limit {
                    error!(topic, error = %err, "publish failed after {retry_limit} retries, dropping");
                    counter!("bus_publish_failures_total", 1, "topic" => topic.to_string());
                    return;
                }
                let backoff = 100u64 << attempt;
                let jitter = rand::thread_rng().gen_range(0..backoff / 2 + 1);
                tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
            }
        }
    }
}
