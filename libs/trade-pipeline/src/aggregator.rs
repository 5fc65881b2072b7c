//! Order-flow aggregator: folds raw trades into footprint candles.
//!
//! One consumer task owns the buffer map; a sweeper task only sends tick
//! messages, so buffers never cross task boundaries until they are
//! detached for finalization. Late trades for already-finalized bars are
//! counted and discarded.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use hot_cache::MarketCache;
use market_bus::{Delivery, MessageBus, Subscription};
use market_store::TimeSeriesStore;
use market_types::{
    bucket_index, topic_symbol, topics, AggressorSide, FootprintCandle, PriceBucket,
    SubscriptionKind, TradeEvent,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::config::AggregatorConfig;
use crate::shutdown::ShutdownSignal;

const CONSUMER_GROUP: &str = "footprint-aggregator";

/// Immediate probe used to drain the queue ahead of sweep ticks.
async fn pending(subscription: &Subscription) -> Option<Delivery> {
    subscription.try_next()
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BufferKey {
    exchange: String,
    symbol: String,
    start_time: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct BucketAcc {
    bid: f64,
    ask: f64,
}

/// One open bar. OPEN until the sweeper detaches it; detaching is the
/// FINALIZING -> FINALIZED transition.
#[derive(Debug)]
struct FootprintBuffer {
    symbol_id: i64,
    tick: f64,
    start_time: i64,
    end_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    total_volume: f64,
    buckets: BTreeMap<i64, BucketAcc>,
}

impl FootprintBuffer {
    fn new(symbol_id: i64, tick: f64, start_time: i64, interval_ms: i64, price: f64) -> Self {
        Self {
            symbol_id,
            tick,
            start_time,
            end_time: start_time + interval_ms - 1,
            open: price,
            high: price,
            low: price,
            close: price,
            total_volume: 0.0,
            buckets: BTreeMap::new(),
        }
    }

    fn apply(&mut self, price: f64, quantity: f64, side: AggressorSide) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
        self.total_volume += quantity;

        let index = bucket_index(price, self.tick);
        match side {
            AggressorSide::Buy => self.buckets.entry(index).or_default().ask += quantity,
            AggressorSide::Sell => self.buckets.entry(index).or_default().bid += quantity,
            // unattributed volume counts toward the total only
            AggressorSide::Unknown => {}
        }
    }
}

pub struct OrderFlowAggregator {
    bus: MessageBus,
    store: TimeSeriesStore,
    cache: MarketCache,
    config: AggregatorConfig,
    shutdown: ShutdownSignal,
}

impl OrderFlowAggregator {
    pub fn new(
        bus: MessageBus,
        store: TimeSeriesStore,
        cache: MarketCache,
        config: AggregatorConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            bus,
            store,
            cache,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> Vec<(&'static str, JoinHandle<()>)> {
        let (sweep_tx, sweep_rx) = mpsc::channel::<()>(1);
        let sweep_interval = Duration::from_millis(self.config.sweep_interval_ms());
        let mut sweeper_shutdown = self.shutdown.clone();

        let sweeper = tokio::spawn(async move {
            while sweeper_shutdown.sleep(sweep_interval).await {
                // a full sweep queue means the consumer is already behind
                if sweep_tx.try_send(()).is_err() {
                    debug!("sweep tick skipped, consumer busy");
                }
            }
        });

        let consumer = tokio::spawn(self.run_consumer(sweep_rx));
        vec![
            ("aggregator-consumer", consumer),
            ("aggregator-sweeper", sweeper),
        ]
    }

    async fn run_consumer(self, mut sweep_rx: mpsc::Receiver<()>) {
        let mut buffers: HashMap<BufferKey, FootprintBuffer> = HashMap::new();
        // highest finalized bar start per (exchange, symbol)
        let mut last_emitted: HashMap<(String, String), i64> = HashMap::new();

        let pattern = topics::market_data_pattern(SubscriptionKind::Trades);
        let mut shutdown = self.shutdown.clone();

        'resubscribe: loop {
            if shutdown.is_shutdown() {
                break;
            }
            let subscription = match self.bus.subscribe(CONSUMER_GROUP, &pattern) {
                Ok(subscription) => subscription,
                Err(err) => {
                    warn!(error = %err, "aggregator cannot subscribe, exiting");
                    break;
                }
            };

            loop {
                // pending trades drain before a sweep so a tick never
                // finalizes a bar mid-batch
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break 'resubscribe,
                    Some(delivery) = pending(&subscription) => {
                        match serde_json::from_slice::<TradeEvent>(&delivery.payload) {
                            Ok(trade) if trade.validate().is_ok() => {
                                self.ingest(&mut buffers, &last_emitted, trade).await;
                            }
                            Ok(_) | Err(_) => {
                                counter!("aggregator_rejected_total", 1, "topic" => delivery.topic.clone());
                            }
                        }
                        subscription.commit(&delivery);
                    }
                    _ = sweep_rx.recv() => {
                        let now = chrono::Utc::now().timestamp_millis();
                        self.sweep(&mut buffers, &mut last_emitted, now).await;
                    }
                    delivery = subscription.recv() => {
                        let Some(delivery) = delivery else { break 'resubscribe };
                        match serde_json::from_slice::<TradeEvent>(&delivery.payload) {
                            Ok(trade) if trade.validate().is_ok() => {
                                self.ingest(&mut buffers, &last_emitted, trade).await;
                            }
                            Ok(_) | Err(_) => {
                                counter!("aggregator_rejected_total", 1, "topic" => delivery.topic.clone());
                            }
                        }
                        subscription.commit(&delivery);
                    }
                }
            }
        }
        debug!("aggregator consumer exiting");
    }

    async fn ingest(
        &self,
        buffers: &mut HashMap<BufferKey, FootprintBuffer>,
        last_emitted: &HashMap<(String, String), i64>,
        trade: TradeEvent,
    ) {
        let start_time = FootprintCandle::bar_start(trade.timestamp, self.config.interval_ms);

        // bars at or before the last finalized start are closed for good
        if let Some(&emitted) = last_emitted.get(&(trade.exchange.clone(), trade.symbol.clone())) {
            if start_time <= emitted {
                counter!("late_trades_total", 1, "symbol" => topic_symbol(&trade.symbol));
                debug!(
                    symbol = %trade.symbol,
                    trade_ts = trade.timestamp,
                    bar_start = start_time,
                    "late trade discarded"
                );
                return;
            }
        }

        let key = BufferKey {
            exchange: trade.exchange.clone(),
            symbol: trade.symbol.clone(),
            start_time,
        };

        if !buffers.contains_key(&key) {
            let (symbol_id, tick) = match self.store.symbol_ref(&trade.exchange, &trade.symbol).await {
                Ok(Some(sym)) => (sym.symbol_id, sym.price_tick),
                Ok(None) => {
                    warn!(exchange = %trade.exchange, symbol = %trade.symbol, "trade for unregistered symbol dropped");
                    counter!("aggregator_rejected_total", 1, "topic" => "unregistered".to_string());
                    return;
                }
                Err(err) => {
                    error!(error = %err, "symbol lookup failed, dropping trade");
                    return;
                }
            };
            let tick = if tick > 0.0 { tick } else { self.config.fallback_price_tick };
            buffers.insert(
                key.clone(),
                FootprintBuffer::new(symbol_id, tick, start_time, self.config.interval_ms, trade.price),
            );
        }

        let side = self.resolve_aggressor(&trade).await;
        if let Some(buffer) = buffers.get_mut(&key) {
            buffer.apply(trade.price, trade.quantity, side);
        }
    }

    /// Aggressor side: explicit field first, then the cached best bid/ask,
    /// otherwise unattributed.
    async fn resolve_aggressor(&self, trade: &TradeEvent) -> AggressorSide {
        if trade.side != AggressorSide::Unknown {
            return trade.side;
        }
        match self.cache.best_bid_ask(&trade.exchange, &trade.symbol).await {
            Ok(Some((best_bid, best_ask))) => {
                if trade.price >= best_ask {
                    AggressorSide::Buy
                } else if trade.price <= best_bid {
                    AggressorSide::Sell
                } else {
                    AggressorSide::Unknown
                }
            }
            _ => AggressorSide::Unknown,
        }
    }

    /// Detach and finalize every buffer whose bar is past `end + grace`,
    /// in start-time order so emission stays monotonic per symbol.
    async fn sweep(
        &self,
        buffers: &mut HashMap<BufferKey, FootprintBuffer>,
        last_emitted: &mut HashMap<(String, String), i64>,
        now_ms: i64,
    ) {
        let mut due: Vec<BufferKey> = buffers
            .iter()
            .filter(|(_, buffer)| buffer.end_time + self.config.finalize_grace_ms <= now_ms)
            .map(|(key, _)| key.clone())
            .collect();
        due.sort_by_key(|key| key.start_time);

        for key in due {
            let Some(buffer) = buffers.remove(&key) else { continue };
            let candle = finalize(
                &key.exchange,
                &key.symbol,
                buffer,
                self.config.interval_ms,
                self.config.value_area_ratio,
                self.config.imbalance_ratio,
            );

            if let Err(err) = self.store.upsert_footprint(&candle).await {
                error!(error = %err, symbol = %key.symbol, start = key.start_time, "footprint store write failed");
                counter!("footprint_store_failures_total", 1, "symbol" => topic_symbol(&key.symbol));
            }

            let topic = topics::footprints(
                &key.exchange,
                &key.symbol,
                &FootprintCandle::interval_label(self.config.interval_ms),
            );
            match serde_json::to_vec(&candle) {
                Ok(payload) => {
                    if let Err(err) = self.bus.publish(&topic, &topic_symbol(&key.symbol), payload) {
                        warn!(error = %err, topic, "footprint publish failed");
                    }
                }
                Err(err) => error!(error = %err, "footprint serialization failed"),
            }

            last_emitted.insert((key.exchange.clone(), key.symbol.clone()), key.start_time);
            debug!(
                symbol = %key.symbol,
                start = key.start_time,
                volume = candle.total_volume,
                delta = candle.total_delta,
                "footprint finalized"
            );
        }
    }
}

/// Compute delta, POC, value area and imbalance flags for a closed bar.
fn finalize(
    exchange: &str,
    symbol: &str,
    buffer: FootprintBuffer,
    interval_ms: i64,
    value_area_ratio: f64,
    imbalance_ratio: f64,
) -> FootprintCandle {
    let tick = buffer.tick;
    let indices: Vec<i64> = buffer.buckets.keys().copied().collect();
    let volumes: Vec<f64> = indices
        .iter()
        .map(|idx| {
            let acc = buffer.buckets[idx];
            acc.bid + acc.ask
        })
        .collect();

    let total_delta: f64 = buffer.buckets.values().map(|acc| acc.ask - acc.bid).sum();

    // POC: max volume, ties to the lower price (first in ascending order)
    let poc_pos = volumes
        .iter()
        .enumerate()
        .fold(0usize, |best, (pos, vol)| if *vol > volumes[best] { pos } else { best });

    let (va_low_pos, va_high_pos) = value_area(&volumes, poc_pos, buffer.total_volume * value_area_ratio);

    let buckets: Vec<PriceBucket> = indices
        .iter()
        .map(|idx| {
            let acc = buffer.buckets[idx];
            let below_bid = buffer.buckets.get(&(idx - 1)).map(|a| a.bid).unwrap_or(0.0);
            let above_ask = buffer.buckets.get(&(idx + 1)).map(|a| a.ask).unwrap_or(0.0);
            PriceBucket {
                price: *idx as f64 * tick,
                bid_volume: acc.bid,
                ask_volume: acc.ask,
                delta: acc.ask - acc.bid,
                // diagonal dominance needs a traded opposing bucket
                ask_imbalance: below_bid > 0.0 && acc.ask >= imbalance_ratio * below_bid,
                bid_imbalance: above_ask > 0.0 && acc.bid >= imbalance_ratio * above_ask,
            }
        })
        .collect();

    let (poc_price, value_area_low, value_area_high) = if indices.is_empty() {
        (buffer.close, buffer.close, buffer.close)
    } else {
        (
            indices[poc_pos] as f64 * tick,
            indices[va_low_pos] as f64 * tick,
            indices[va_high_pos] as f64 * tick,
        )
    };

    FootprintCandle {
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        symbol_id: buffer.symbol_id,
        interval_ms,
        start_time: buffer.start_time,
        end_time: buffer.end_time,
        open: buffer.open,
        high: buffer.high,
        low: buffer.low,
        close: buffer.close,
        total_volume: buffer.total_volume,
        total_delta,
        poc_price,
        value_area_high,
        value_area_low,
        buckets,
    }
}

/// Smallest contiguous bucket range around the POC whose cumulative volume
/// reaches `target`. Expansion prefers the neighbor with the higher
/// volume and stops as soon as the target is covered.
fn value_area(volumes: &[f64], poc_pos: usize, target: f64) -> (usize, usize) {
    if volumes.is_empty() {
        return (0, 0);
    }
    let mut low = poc_pos;
    let mut high = poc_pos;
    let mut covered = volumes[poc_pos];

    while covered < target {
        let below = low.checked_sub(1).map(|pos| volumes[pos]);
        let above = (high + 1 < volumes.len()).then(|| volumes[high + 1]);
        match (below, above) {
            (None, None) => break,
            (Some(_), None) => {
                low -= 1;
                covered += volumes[low];
            }
            (None, Some(_)) => {
                high += 1;
                covered += volumes[high];
            }
            (Some(b), Some(a)) => {
                if b > a {
                    low -= 1;
                    covered += volumes[low];
                } else {
                    high += 1;
                    covered += volumes[high];
                }
            }
        }
    }
    (low, high)
}
