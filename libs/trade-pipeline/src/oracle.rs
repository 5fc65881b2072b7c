//! Oracle processor: periodic order-book imbalance scan over a watch
//! list, publishing insights to `market.insights`.

use std::time::Duration;

use hot_cache::MarketCache;
use market_bus::MessageBus;
use market_types::{topic_symbol, topics, OracleInsight, Pressure};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::shutdown::ShutdownSignal;

pub struct OracleProcessor {
    bus: MessageBus,
    cache: MarketCache,
    config: OracleConfig,
    shutdown: ShutdownSignal,
}

impl OracleProcessor {
    pub fn new(
        bus: MessageBus,
        cache: MarketCache,
        config: OracleConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            bus,
            cache,
            config,
            shutdown,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let interval = Duration::from_millis(self.config.interval_ms);
        let mut shutdown = self.shutdown.clone();
        loop {
            // per-market failures are isolated; the next tick starts clean
            for market in &self.config.watch_list {
                match self.scan(&market.exchange, &market.symbol).await {
                    Ok(Some(insight)) => self.publish(insight),
                    Ok(None) => {
                        debug!(exchange = %market.exchange, symbol = %market.symbol, "no cached book to scan")
                    }
                    Err(err) => {
                        warn!(exchange = %market.exchange, symbol = %market.symbol, error = %err, "oracle scan failed")
                    }
                }
            }
            if !shutdown.sleep(interval).await {
                break;
            }
        }
        debug!("oracle processor exiting");
    }

    async fn scan(&self, exchange: &str, symbol: &str) -> anyhow::Result<Option<OracleInsight>> {
        let Some(book) = self.cache.order_book(exchange, symbol).await? else {
            return Ok(None);
        };
        let bid_volume: f64 = book.bids.iter().take(self.config.depth).map(|l| l.size).sum();
        let ask_volume: f64 = book.asks.iter().take(self.config.depth).map(|l| l.size).sum();
        let total = bid_volume + ask_volume;
        if total <= 0.0 {
            return Ok(None);
        }
        let ratio = bid_volume / total;
        Ok(Some(self.classify(exchange, symbol, ratio)))
    }

    fn classify(&self, exchange: &str, symbol: &str, ratio: f64) -> OracleInsight {
        let classification = if ratio >= self.config.buy_threshold {
            Pressure::BuyPressure
        } else if ratio <= self.config.sell_threshold {
            Pressure::SellPressure
        } else {
            Pressure::Balanced
        };
        let confidence = (((ratio - 0.5).abs() * 2.0) * 10_000.0).round() / 10_000.0;
        let message = match classification {
            Pressure::BuyPressure => format!(
                "buy pressure: bids hold {:.0}% of top-{} volume",
                ratio * 100.0,
                self.config.depth
            ),
            Pressure::SellPressure => format!(
                "sell pressure: bids hold only {:.0}% of top-{} volume",
                ratio * 100.0,
                self.config.depth
            ),
            Pressure::Balanced => format!("balanced book ({:.0}% bid share)", ratio * 100.0),
        };
        OracleInsight {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            insight_type: "orderbook_imbalance".to_string(),
            ratio,
            classification,
            confidence,
            message,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    fn publish(&self, insight: OracleInsight) {
        match serde_json::to_vec(&insight) {
            Ok(payload) => {
                if let Err(err) =
                    self.bus
                        .publish(topics::MARKET_INSIGHTS, &topic_symbol(&insight.symbol), payload)
                {
                    warn!(error = %err, "insight publish failed");
                }
            }
            Err(err) => warn!(error = %err, "insight serialization failed"),
        }
    }
}
