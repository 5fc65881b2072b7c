//! The market-data-to-trade pipeline: six supervised components wired
//! through the bus and the hot cache.
//!
//! Dependency order, leaves first: exchange adapters, store, cache, bus;
//! then feed, persistence consumers, order-flow aggregator and oracle in
//! parallel; then the strategy engine; then the order executor. Shutdown
//! runs the same order in reverse.

pub mod aggregator;
pub mod app;
pub mod config;
pub mod consumers;
pub mod executor;
pub mod feed;
pub mod notify;
pub mod oracle;
pub mod risk;
pub mod shutdown;
pub mod strategy;

pub use aggregator::OrderFlowAggregator;
pub use app::PipelineApp;
pub use config::PipelineConfig;
pub use consumers::PersistenceConsumers;
pub use executor::OrderExecutor;
pub use feed::{MarketDataFeed, SubscriptionStatus};
pub use notify::{LogNotifier, Notifier};
pub use oracle::OracleProcessor;
pub use risk::{RiskOutcome, RiskPolicy};
pub use shutdown::{ShutdownController, ShutdownSignal};
pub use strategy::StrategyEngine;

use std::collections::HashMap;
use std::sync::Arc;

use exchange_core::ExchangeAdapter;

/// Process-wide set of exchange adapters, created once at startup and
/// passed explicitly; tests inject fakes here.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Arc<HashMap<String, Arc<dyn ExchangeAdapter>>>,
}

impl AdapterRegistry {
    pub fn new(adapters: HashMap<String, Arc<dyn ExchangeAdapter>>) -> Self {
        Self {
            adapters: Arc::new(adapters),
        }
    }

    pub fn single(adapter: Arc<dyn ExchangeAdapter>) -> Self {
        let mut adapters = HashMap::new();
        adapters.insert(adapter.exchange_id().to_string(), adapter);
        Self::new(adapters)
    }

    pub fn get(&self, exchange: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.get(exchange).cloned()
    }

    pub fn exchanges(&self) -> Vec<String> {
        self.adapters.keys().cloned().collect()
    }
}
