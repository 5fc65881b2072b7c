//! Wires the pipeline together and owns ordered startup/shutdown.

use std::sync::Arc;
use std::time::Duration;

use hot_cache::{HotCache, MarketCache};
use market_bus::MessageBus;
use market_store::TimeSeriesStore;
use tokio::task::JoinHandle;
use tracing::info;

use crate::aggregator::OrderFlowAggregator;
use crate::config::PipelineConfig;
use crate::consumers::PersistenceConsumers;
use crate::executor::OrderExecutor;
use crate::feed::MarketDataFeed;
use crate::notify::Notifier;
use crate::oracle::OracleProcessor;
use crate::risk::RiskPolicy;
use crate::shutdown::{join_with_grace, ShutdownController};
use crate::strategy::StrategyEngine;
use crate::AdapterRegistry;

pub struct PipelineApp;

/// Handles for a started pipeline; consumed by [`RunningPipeline::shutdown`].
pub struct RunningPipeline {
    pub feed: Arc<MarketDataFeed>,
    bus: MessageBus,
    mid_controller: ShutdownController,
    strategy_controller: ShutdownController,
    executor_controller: ShutdownController,
    mid_tasks: Vec<(&'static str, JoinHandle<()>)>,
    strategy_task: Vec<(&'static str, JoinHandle<()>)>,
    executor_task: Vec<(&'static str, JoinHandle<()>)>,
}

impl PipelineApp {
    /// Start every component in dependency order, leaves first.
    pub async fn start(
        config: PipelineConfig,
        store: TimeSeriesStore,
        cache: Arc<dyn HotCache>,
        bus: MessageBus,
        adapters: AdapterRegistry,
        notifier: Arc<dyn Notifier>,
    ) -> anyhow::Result<RunningPipeline> {
        let market_cache = MarketCache::new(cache);

        // symbol registration is reference data for every consumer
        for subscription in &config.subscriptions {
            let quote = subscription.symbol.split('/').nth(1).unwrap_or("USD").to_string();
            store
                .register_symbol(
                    &subscription.exchange,
                    &subscription.symbol,
                    subscription.price_tick,
                    &quote,
                )
                .await?;
        }

        let mid_controller = ShutdownController::new();
        let strategy_controller = ShutdownController::new();
        let executor_controller = ShutdownController::new();

        // (A) market data feed
        let feed = MarketDataFeed::new(
            bus.clone(),
            adapters.clone(),
            config.feed.clone(),
            mid_controller.signal(),
        );
        for subscription in &config.subscriptions {
            feed.add_subscription(
                &subscription.exchange,
                &subscription.symbol,
                subscription.kind,
                subscription.active,
            )?;
        }
        let mut mid_tasks = vec![("feed-health", feed.spawn_health_checker())];

        // (B) persistence consumers
        mid_tasks.extend(
            PersistenceConsumers::new(
                bus.clone(),
                store.clone(),
                market_cache.clone(),
                mid_controller.signal(),
            )
            .spawn(),
        );

        // (C) order flow aggregator
        mid_tasks.extend(
            OrderFlowAggregator::new(
                bus.clone(),
                store.clone(),
                market_cache.clone(),
                config.aggregator.clone(),
                mid_controller.signal(),
            )
            .spawn(),
        );

        // (D) oracle processor
        mid_tasks.push((
            "oracle",
            OracleProcessor::new(
                bus.clone(),
                market_cache.clone(),
                config.oracle.clone(),
                mid_controller.signal(),
            )
            .spawn(),
        ));

        // (E) strategy engine
        let strategy_task = vec![(
            "strategy-engine",
            StrategyEngine::new(
                store.clone(),
                market_cache.clone(),
                bus.clone(),
                config.strategy.clone(),
                strategy_controller.signal(),
            )
            .spawn(),
        )];

        // (F) order executor
        let risk = Arc::new(RiskPolicy::standard(
            store.clone(),
            market_cache.clone(),
            &config.executor,
        ));
        let executor_task = vec![(
            "order-executor",
            OrderExecutor::new(
                bus.clone(),
                store,
                market_cache,
                adapters,
                risk,
                notifier,
                config.executor.clone(),
                executor_controller.signal(),
            )
            .spawn(),
        )];

        info!("pipeline started");
        Ok(RunningPipeline {
            feed,
            bus,
            mid_controller,
            strategy_controller,
            executor_controller,
            mid_tasks,
            strategy_task,
            executor_task,
        })
    }
}

impl RunningPipeline {
    /// Stop components in reverse dependency order, each stage within the
    /// grace period. The executor finishes any in-flight placement first.
    pub async fn shutdown(self, grace: Duration) {
        info!("pipeline shutting down");

        self.executor_controller.shutdown();
        join_with_grace(self.executor_task, grace).await;

        self.strategy_controller.shutdown();
        join_with_grace(self.strategy_task, grace).await;

        self.feed.stop_all();
        self.mid_controller.shutdown();
        join_with_grace(self.mid_tasks, grace).await;

        self.bus.close();
        info!("pipeline stopped");
    }
}
