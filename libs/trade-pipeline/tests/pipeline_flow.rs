//! End-to-end pipeline scenarios over the in-process bus, an in-memory
//! store and the paper exchange.

use std::sync::Arc;
use std::time::Duration;

use exchange_core::PaperExchange;
use hot_cache::{HotCache, MarketCache, MemoryCache};
use market_bus::MessageBus;
use market_store::{NewStrategy, TimeSeriesStore};
use market_types::{
    topics, AggressorSide, BookLevel, FootprintCandle, OrderBookSnapshot, OrderKind, OrderSide,
    StrategyParams, StrategyStatus, SubscriptionKind, TickerSnapshot, TradeEvent, TradingSignal,
};
use trade_pipeline::config::{AggregatorConfig, ExecutorConfig, FeedConfig, OracleConfig, StrategyConfig, WatchedMarket};
use trade_pipeline::{
    AdapterRegistry, LogNotifier, MarketDataFeed, OracleProcessor, OrderExecutor,
    OrderFlowAggregator, PersistenceConsumers, RiskPolicy, ShutdownController, StrategyEngine,
};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

// a fixed bar boundary for 60s bars: 28_333_334 * 60_000
const BAR_START: i64 = 1_700_000_040_000;

fn trade(id: &str, offset_ms: i64, price: f64, quantity: f64, side: AggressorSide) -> TradeEvent {
    TradeEvent {
        exchange: "paper".into(),
        symbol: "BTC/USDT".into(),
        timestamp: BAR_START + offset_ms,
        trade_id: id.into(),
        price,
        quantity,
        side,
        is_maker: None,
    }
}

fn book(bids: Vec<BookLevel>, asks: Vec<BookLevel>) -> OrderBookSnapshot {
    OrderBookSnapshot {
        exchange: "paper".into(),
        symbol: "BTC/USDT".into(),
        timestamp: BAR_START,
        bids,
        asks,
        sequence: None,
    }
}

fn ticker(last: f64) -> TickerSnapshot {
    TickerSnapshot {
        exchange: "paper".into(),
        symbol: "BTC/USDT".into(),
        timestamp: BAR_START,
        open: last,
        high: last,
        low: last,
        last,
        base_volume: 100.0,
        quote_volume: 100.0 * last,
        best_bid: None,
        best_ask: None,
    }
}

fn signal(timestamp: i64) -> TradingSignal {
    TradingSignal {
        strategy_id: 7,
        owner_id: 3,
        exchange_config_id: 1,
        exchange: "paper".into(),
        symbol: "BTC/USDT".into(),
        side: OrderSide::Buy,
        kind: OrderKind::Market,
        amount: Some(0.1),
        quote_amount: None,
        limit_price: None,
        stop_loss: None,
        take_profit: None,
        leverage: None,
        state_digest: "digest".into(),
        timestamp,
    }
}

async fn setup() -> (MessageBus, TimeSeriesStore, MarketCache) {
    let bus = MessageBus::new();
    let store = TimeSeriesStore::open(":memory:").await.unwrap();
    store.register_symbol("paper", "BTC/USDT", 0.5, "USDT").await.unwrap();
    let cache = MarketCache::new(Arc::new(MemoryCache::new()) as Arc<dyn HotCache>);
    (bus, store, cache)
}

fn publish_json<T: serde::Serialize>(bus: &MessageBus, topic: &str, value: &T) {
    bus.publish(topic, "BTCUSDT", serde_json::to_vec(value).unwrap()).unwrap();
}

/// S1 + S5: footprint aggregation with a late trade afterwards.
#[tokio::test]
async fn test_footprint_aggregation_and_late_trade() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    let config = AggregatorConfig {
        interval_ms: 60_000,
        sweep_interval_ms: Some(50),
        finalize_grace_ms: 1_000,
        ..Default::default()
    };
    let tasks = OrderFlowAggregator::new(
        bus.clone(),
        store.clone(),
        cache.clone(),
        config,
        controller.signal(),
    )
    .spawn();

    let footprints = bus
        .subscribe("test-footprints", "footprints.processed.paper.BTCUSDT.1m")
        .unwrap();

    let topic = topics::market_data("paper", "BTC/USDT", SubscriptionKind::Trades);
    publish_json(&bus, &topic, &trade("t-1", 10, 100.3, 1.0, AggressorSide::Buy));
    publish_json(&bus, &topic, &trade("t-2", 20, 100.7, 2.0, AggressorSide::Sell));
    publish_json(&bus, &topic, &trade("t-3", 30, 100.3, 1.0, AggressorSide::Buy));

    let delivery = tokio::time::timeout(RECV_TIMEOUT, footprints.recv())
        .await
        .expect("footprint emitted")
        .unwrap();
    footprints.commit(&delivery);
    let candle: FootprintCandle = serde_json::from_slice(&delivery.payload).unwrap();

    assert_eq!(candle.start_time, BAR_START);
    assert_eq!(candle.end_time, BAR_START + 60_000 - 1);
    assert_eq!(
        (candle.open, candle.high, candle.low, candle.close),
        (100.3, 100.7, 100.3, 100.3)
    );
    assert_eq!(candle.total_volume, 4.0);
    assert_eq!(candle.total_delta, 0.0);
    assert_eq!(candle.poc_price, 100.0);
    assert_eq!(candle.value_area_low, 100.0);
    assert_eq!(candle.value_area_high, 100.5);
    assert_eq!(candle.buckets.len(), 2);
    assert_eq!(candle.buckets[0].price, 100.0);
    assert_eq!(candle.buckets[0].ask_volume, 2.0);
    assert_eq!(candle.buckets[0].bid_volume, 0.0);
    assert_eq!(candle.buckets[1].price, 100.5);
    assert_eq!(candle.buckets[1].bid_volume, 2.0);

    // a finalized candle read back from the store equals the emitted one
    let symbol = store.symbol_ref("paper", "BTC/USDT").await.unwrap().unwrap();
    let stored = store
        .footprint(symbol.symbol_id, "paper", 60_000, BAR_START)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, candle);

    // S5: a trade for the already-finalized bar is discarded
    publish_json(&bus, &topic, &trade("t-late", 40, 100.9, 1.0, AggressorSide::Buy));
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(footprints.try_next().is_none(), "no second candle for the same bar");
    let unchanged = store
        .footprint(symbol.symbol_id, "paper", 60_000, BAR_START)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.total_volume, 4.0);

    controller.shutdown();
    for (_, task) in tasks {
        let _ = task.await;
    }
}

/// Emitted candles keep strictly increasing start times per symbol.
#[tokio::test]
async fn test_footprint_emission_order() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();
    let config = AggregatorConfig {
        interval_ms: 60_000,
        sweep_interval_ms: Some(50),
        ..Default::default()
    };
    let tasks = OrderFlowAggregator::new(
        bus.clone(),
        store.clone(),
        cache,
        config,
        controller.signal(),
    )
    .spawn();

    let footprints = bus
        .subscribe("test-order", "footprints.processed.paper.BTCUSDT.1m")
        .unwrap();
    let topic = topics::market_data("paper", "BTC/USDT", SubscriptionKind::Trades);

    // two bars fed out of order within one batch
    publish_json(&bus, &topic, &trade("b2", 60_010, 101.0, 1.0, AggressorSide::Buy));
    publish_json(&bus, &topic, &trade("b1", 10, 100.0, 1.0, AggressorSide::Sell));

    let first = tokio::time::timeout(RECV_TIMEOUT, footprints.recv()).await.unwrap().unwrap();
    footprints.commit(&first);
    let second = tokio::time::timeout(RECV_TIMEOUT, footprints.recv()).await.unwrap().unwrap();
    footprints.commit(&second);

    let first: FootprintCandle = serde_json::from_slice(&first.payload).unwrap();
    let second: FootprintCandle = serde_json::from_slice(&second.payload).unwrap();
    assert!(second.start_time > first.start_time);

    controller.shutdown();
    for (_, task) in tasks {
        let _ = task.await;
    }
}

/// Persistence consumers: store rows plus hot cache state, idempotently.
#[tokio::test]
async fn test_persistence_consumers_round_trip() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();
    let tasks = PersistenceConsumers::new(
        bus.clone(),
        store.clone(),
        cache.clone(),
        controller.signal(),
    )
    .spawn();

    let the_book = book(
        vec![BookLevel::new(100.0, 2.0)],
        vec![BookLevel::new(100.5, 1.0)],
    );
    let the_trade = trade("t-1", 10, 100.3, 1.0, AggressorSide::Buy);
    let the_ticker = ticker(100.5);

    publish_json(&bus, &topics::market_data("paper", "BTC/USDT", SubscriptionKind::Orderbook), &the_book);
    publish_json(&bus, &topics::market_data("paper", "BTC/USDT", SubscriptionKind::Trades), &the_trade);
    publish_json(&bus, &topics::market_data("paper", "BTC/USDT", SubscriptionKind::Ticker), &the_ticker);
    // replayed trade must not create a second row
    publish_json(&bus, &topics::market_data("paper", "BTC/USDT", SubscriptionKind::Trades), &the_trade);

    let symbol = store.symbol_ref("paper", "BTC/USDT").await.unwrap().unwrap();
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let trades = store.trade_count(symbol.symbol_id).await.unwrap();
        let books = store.order_book_count(symbol.symbol_id).await.unwrap();
        let tickers = store.ticker_count(symbol.symbol_id).await.unwrap();
        if trades == 1 && books == 1 && tickers == 1 {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "consumers did not persist in time");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let cached_book = cache.order_book("paper", "BTC/USDT").await.unwrap().unwrap();
    assert!(cached_book.best_bid().unwrap() <= cached_book.best_ask().unwrap());

    let cached_trades = cache.recent_trades("paper", "BTC/USDT").await.unwrap();
    assert_eq!(cached_trades.last().unwrap(), &the_trade);

    let cached_ticker = cache.ticker("paper", "BTC/USDT").await.unwrap().unwrap();
    assert_eq!(cached_ticker, the_ticker);

    controller.shutdown();
    for (_, task) in tasks {
        let _ = task.await;
    }
}

/// S2: order book imbalance insight with buy pressure.
#[tokio::test]
async fn test_oracle_insight_buy_pressure() {
    let (bus, _store, cache) = setup().await;
    let controller = ShutdownController::new();

    cache
        .put_order_book(&book(
            (0..5).map(|i| BookLevel::new(100.0 - i as f64 * 0.5, 16.0)).collect(),
            (0..5).map(|i| BookLevel::new(100.5 + i as f64 * 0.5, 4.0)).collect(),
        ))
        .await
        .unwrap();

    let insights = bus.subscribe("test-insights", topics::MARKET_INSIGHTS).unwrap();

    let config = OracleConfig {
        interval_ms: 50,
        depth: 5,
        watch_list: vec![WatchedMarket {
            exchange: "paper".into(),
            symbol: "BTC/USDT".into(),
        }],
        ..Default::default()
    };
    let task = OracleProcessor::new(bus.clone(), cache, config, controller.signal()).spawn();

    let delivery = tokio::time::timeout(RECV_TIMEOUT, insights.recv()).await.unwrap().unwrap();
    insights.commit(&delivery);
    let insight: market_types::OracleInsight = serde_json::from_slice(&delivery.payload).unwrap();

    assert_eq!(insight.insight_type, "orderbook_imbalance");
    assert!((insight.ratio - 0.8).abs() < 1e-9);
    assert!((insight.confidence - 0.6).abs() < 1e-9);
    assert!(insight.message.contains("buy pressure"));

    controller.shutdown();
    let _ = task.await;
}

/// S3: two identical signals produce exactly one order.
#[tokio::test]
async fn test_executor_idempotent_placement() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    let paper = Arc::new(PaperExchange::new("paper"));
    paper.add_market("BTC/USDT", 0.5, "USDT");
    paper.seed_book(book(
        vec![BookLevel::new(100.0, 50.0)],
        vec![BookLevel::new(100.5, 50.0)],
    ));

    // executor sizing and slippage both read the cache
    cache.put_ticker(&ticker(100.5)).await.unwrap();
    cache
        .put_order_book(&book(
            vec![BookLevel::new(100.0, 50.0)],
            vec![BookLevel::new(100.5, 50.0)],
        ))
        .await
        .unwrap();

    let config = ExecutorConfig::default();
    let risk = Arc::new(RiskPolicy::standard(store.clone(), cache.clone(), &config));
    let task = OrderExecutor::new(
        bus.clone(),
        store.clone(),
        cache,
        AdapterRegistry::single(paper.clone()),
        risk,
        Arc::new(LogNotifier),
        config,
        controller.signal(),
    )
    .spawn();

    let the_signal = signal(1_700_000_000_000);
    publish_json(&bus, topics::TRADING_SIGNALS, &the_signal);
    publish_json(&bus, topics::TRADING_SIGNALS, &the_signal);

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while store.order_count().await.unwrap() < 1 {
        assert!(std::time::Instant::now() < deadline, "order was not placed");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // let the duplicate drain
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert_eq!(store.order_count().await.unwrap(), 1);
    assert_eq!(paper.orders_placed(), 1);

    let order = store
        .find_order_by_client_id(&trade_pipeline::executor::client_order_id(&the_signal))
        .await
        .unwrap()
        .expect("order recorded under derived client-order-id");
    assert_eq!(order.filled_quantity, 0.1);
    let fills = store.fills_for_order(order.id).await.unwrap();
    assert_eq!(fills.len(), 1);
    assert_eq!(fills[0].price, 100.5);

    controller.shutdown();
    let _ = task.await;
}

/// Executor retries transient placement errors, then succeeds once.
#[tokio::test]
async fn test_executor_retries_transient_errors() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    let paper = Arc::new(PaperExchange::new("paper"));
    paper.add_market("BTC/USDT", 0.5, "USDT");
    paper.seed_book(book(
        vec![BookLevel::new(100.0, 50.0)],
        vec![BookLevel::new(100.5, 50.0)],
    ));
    paper.script_order_error(exchange_core::ExchangeError::Transient("flaky".into()));

    cache.put_ticker(&ticker(100.5)).await.unwrap();
    cache
        .put_order_book(&book(
            vec![BookLevel::new(100.0, 50.0)],
            vec![BookLevel::new(100.5, 50.0)],
        ))
        .await
        .unwrap();

    let config = ExecutorConfig::default();
    let risk = Arc::new(RiskPolicy::standard(store.clone(), cache.clone(), &config));
    let task = OrderExecutor::new(
        bus.clone(),
        store.clone(),
        cache,
        AdapterRegistry::single(paper.clone()),
        risk,
        Arc::new(LogNotifier),
        config,
        controller.signal(),
    )
    .spawn();

    publish_json(&bus, topics::TRADING_SIGNALS, &signal(1_700_000_111_000));

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    while store.order_count().await.unwrap() < 1 {
        assert!(std::time::Instant::now() < deadline, "retry did not recover");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(paper.orders_placed(), 1);

    controller.shutdown();
    let _ = task.await;
}

/// Risk rejection surfaces on the strategy and never reaches the exchange.
#[tokio::test]
async fn test_executor_risk_rejection() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    let strategy_id = store
        .insert_strategy(&NewStrategy {
            owner_id: 3,
            exchange_config_id: 1,
            name: "capped".into(),
            exchange: "paper".into(),
            symbol: "BTC/USDT".into(),
            params: StrategyParams::OrderbookImbalance {
                depth: 5,
                buy_threshold: 0.65,
                sell_threshold: 0.35,
                order_size: 0.1,
            },
            desired_active: true,
        })
        .await
        .unwrap();

    let paper = Arc::new(PaperExchange::new("paper"));
    paper.add_market("BTC/USDT", 0.5, "USDT");
    paper.seed_book(book(
        vec![BookLevel::new(100.0, 50.0)],
        vec![BookLevel::new(100.5, 50.0)],
    ));
    cache.put_ticker(&ticker(100.5)).await.unwrap();
    cache
        .put_order_book(&book(
            vec![BookLevel::new(100.0, 50.0)],
            vec![BookLevel::new(100.5, 50.0)],
        ))
        .await
        .unwrap();

    let config = ExecutorConfig {
        user_exposure_cap_usd: 1.0, // any order breaches it
        ..Default::default()
    };
    let risk = Arc::new(RiskPolicy::standard(store.clone(), cache.clone(), &config));
    let task = OrderExecutor::new(
        bus.clone(),
        store.clone(),
        cache,
        AdapterRegistry::single(paper.clone()),
        risk,
        Arc::new(LogNotifier),
        config,
        controller.signal(),
    )
    .spawn();

    let mut rejected = signal(1_700_000_222_000);
    rejected.strategy_id = strategy_id;
    publish_json(&bus, topics::TRADING_SIGNALS, &rejected);

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let strategy = store.get_strategy(strategy_id).await.unwrap().unwrap();
        if strategy.status == StrategyStatus::Error {
            assert!(strategy.health_message.unwrap().contains("Risk check failed"));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "risk rejection not recorded");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(paper.orders_placed(), 0);
    assert_eq!(store.order_count().await.unwrap(), 0);

    controller.shutdown();
    let _ = task.await;
}

/// S4: five consecutive evaluation failures auto-disable the strategy.
#[tokio::test]
async fn test_strategy_auto_disable_after_consecutive_errors() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    let strategy_id = store
        .insert_strategy(&NewStrategy {
            owner_id: 3,
            exchange_config_id: 1,
            name: "always-fails".into(),
            exchange: "paper".into(),
            symbol: "BTC/USDT".into(),
            // depth 0 raises on every evaluation
            params: StrategyParams::OrderbookImbalance {
                depth: 0,
                buy_threshold: 0.65,
                sell_threshold: 0.35,
                order_size: 0.1,
            },
            desired_active: true,
        })
        .await
        .unwrap();

    let config = StrategyConfig {
        manager_interval_ms: 50,
        eval_interval_ms: 25,
        max_consecutive_errors: 5,
    };
    let task = StrategyEngine::new(store.clone(), cache, bus, config, controller.signal()).spawn();

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    loop {
        let strategy = store.get_strategy(strategy_id).await.unwrap().unwrap();
        if strategy.status == StrategyStatus::Stopped && !strategy.desired_active {
            assert_eq!(strategy.consecutive_errors, 5);
            assert!(strategy.health_message.unwrap().contains("auto-disabled"));
            break;
        }
        assert!(std::time::Instant::now() < deadline, "strategy was not auto-disabled");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    controller.shutdown();
    let _ = task.await;
}

/// A healthy strategy reads the cache and emits a signal.
#[tokio::test]
async fn test_strategy_emits_signal_from_cached_book() {
    let (bus, store, cache) = setup().await;
    let controller = ShutdownController::new();

    store
        .insert_strategy(&NewStrategy {
            owner_id: 3,
            exchange_config_id: 1,
            name: "imbalance".into(),
            exchange: "paper".into(),
            symbol: "BTC/USDT".into(),
            params: StrategyParams::OrderbookImbalance {
                depth: 5,
                buy_threshold: 0.65,
                sell_threshold: 0.35,
                order_size: 0.1,
            },
            desired_active: true,
        })
        .await
        .unwrap();

    cache
        .put_order_book(&book(
            vec![BookLevel::new(100.0, 80.0)],
            vec![BookLevel::new(100.5, 20.0)],
        ))
        .await
        .unwrap();

    let signals = bus.subscribe("test-signals", topics::TRADING_SIGNALS).unwrap();

    let config = StrategyConfig {
        manager_interval_ms: 50,
        eval_interval_ms: 25,
        max_consecutive_errors: 5,
    };
    let task = StrategyEngine::new(store.clone(), cache, bus.clone(), config, controller.signal()).spawn();

    let delivery = tokio::time::timeout(RECV_TIMEOUT, signals.recv()).await.unwrap().unwrap();
    signals.commit(&delivery);
    let emitted: TradingSignal = serde_json::from_slice(&delivery.payload).unwrap();
    assert_eq!(emitted.side, OrderSide::Buy);
    assert_eq!(emitted.amount, Some(0.1));
    assert!(emitted.validate().is_ok());

    controller.shutdown();
    let _ = task.await;
}

/// S6: a broken stream reconnects and publishes again.
#[tokio::test]
async fn test_feed_reconnects_after_stream_error() {
    let (bus, _store, _cache) = setup().await;
    let controller = ShutdownController::new();

    let paper = Arc::new(PaperExchange::new("paper"));
    let feed = MarketDataFeed::new(
        bus.clone(),
        AdapterRegistry::single(paper.clone()),
        FeedConfig {
            reconnect_delay_ms: 50,
            connection_check_interval_ms: 200,
            publish_retry_limit: 3,
        },
        controller.signal(),
    );
    let health = feed.spawn_health_checker();

    feed.add_subscription("paper", "BTC/USDT", SubscriptionKind::Trades, true).unwrap();

    let topic = topics::market_data("paper", "BTC/USDT", SubscriptionKind::Trades);
    let consumer = bus.subscribe("test-feed", &topic).unwrap();

    // the watch loop attaches asynchronously; push until a trade lands
    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    let first = loop {
        paper.push_trade(trade("t-first", 10, 100.3, 1.0, AggressorSide::Buy));
        if let Ok(Some(delivery)) =
            tokio::time::timeout(Duration::from_millis(50), consumer.recv()).await
        {
            break delivery;
        }
        assert!(std::time::Instant::now() < deadline, "feed never published");
    };
    consumer.commit(&first);

    // injected disconnect: the loop records the error and reconnects
    paper.break_trade_stream("BTC/USDT");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let statuses = feed.list_subscriptions();
    assert!(statuses[0].last_error.is_some(), "stream error recorded");

    let deadline = std::time::Instant::now() + RECV_TIMEOUT;
    let second = loop {
        paper.push_trade(trade("t-second", 20, 100.5, 1.0, AggressorSide::Sell));
        match tokio::time::timeout(Duration::from_millis(50), consumer.recv()).await {
            Ok(Some(delivery)) => {
                let event: TradeEvent = serde_json::from_slice(&delivery.payload).unwrap();
                if event.trade_id == "t-second" {
                    break delivery;
                }
                consumer.commit(&delivery);
            }
            _ => {}
        }
        assert!(std::time::Instant::now() < deadline, "feed did not resume after reconnect");
    };
    consumer.commit(&second);

    // deactivation tears the loop down
    feed.add_subscription("paper", "BTC/USDT", SubscriptionKind::Trades, false).unwrap();
    assert!(feed.list_subscriptions().is_empty());

    controller.shutdown();
    let _ = health.await;
}
