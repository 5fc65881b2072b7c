//! Pre-trade risk policy: a sequence of checks, first failure wins.

use async_trait::async_trait;
use hot_cache::MarketCache;
use market_store::TimeSeriesStore;
use market_types::{OrderKind, OrderSide, TradingSignal};
use tracing::debug;

use crate::config::ExecutorConfig;

/// Everything a check may look at for one signal.
pub struct RiskContext<'a> {
    pub signal: &'a TradingSignal,
    /// Estimated USD value of the order (0 when unpriceable).
    pub usd_value: f64,
    /// Base amount after quote conversion.
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskOutcome {
    pub passed: bool,
    pub reason: Option<String>,
}

impl RiskOutcome {
    fn pass() -> Self {
        Self {
            passed: true,
            reason: None,
        }
    }

    fn fail(reason: String) -> Self {
        Self {
            passed: false,
            reason: Some(reason),
        }
    }
}

#[async_trait]
pub trait RiskCheck: Send + Sync {
    fn name(&self) -> &'static str;
    async fn check(&self, ctx: &RiskContext<'_>) -> Result<(), String>;
}

/// Composite policy; the reference set is [`RiskPolicy::standard`].
pub struct RiskPolicy {
    checks: Vec<Box<dyn RiskCheck>>,
}

impl RiskPolicy {
    pub fn new(checks: Vec<Box<dyn RiskCheck>>) -> Self {
        Self { checks }
    }

    /// User exposure cap, per-strategy cap, market slippage probe.
    pub fn standard(store: TimeSeriesStore, cache: MarketCache, config: &ExecutorConfig) -> Self {
        Self::new(vec![
            Box::new(UserExposureCheck {
                store: store.clone(),
                cap_usd: config.user_exposure_cap_usd,
            }),
            Box::new(StrategyExposureCheck {
                store,
                cap_usd: config.strategy_exposure_cap_usd,
            }),
            Box::new(SlippageCheck {
                cache,
                depth: config.slippage_depth,
                max_impact_pct: config.max_slippage_pct,
            }),
        ])
    }

    pub async fn pre_trade_check(&self, ctx: &RiskContext<'_>) -> RiskOutcome {
        for check in &self.checks {
            if let Err(reason) = check.check(ctx).await {
                return RiskOutcome::fail(format!("Risk check failed: {reason}"));
            }
            debug!(check = check.name(), "risk check passed");
        }
        RiskOutcome::pass()
    }
}

struct UserExposureCheck {
    store: TimeSeriesStore,
    cap_usd: f64,
}

#[async_trait]
impl RiskCheck for UserExposureCheck {
    fn name(&self) -> &'static str {
        "user-exposure"
    }

    async fn check(&self, ctx: &RiskContext<'_>) -> Result<(), String> {
        let open = self
            .store
            .open_exposure_usd(ctx.signal.owner_id)
            .await
            .map_err(|e| format!("exposure lookup failed: {e}"))?;
        if open + ctx.usd_value > self.cap_usd {
            return Err(format!(
                "user exposure limit (open {open:.2} + order {:.2} > cap {:.2})",
                ctx.usd_value, self.cap_usd
            ));
        }
        Ok(())
    }
}

struct StrategyExposureCheck {
    store: TimeSeriesStore,
    cap_usd: f64,
}

#[async_trait]
impl RiskCheck for StrategyExposureCheck {
    fn name(&self) -> &'static str {
        "strategy-exposure"
    }

    async fn check(&self, ctx: &RiskContext<'_>) -> Result<(), String> {
        let open = self
            .store
            .strategy_exposure_usd(ctx.signal.strategy_id)
            .await
            .map_err(|e| format!("exposure lookup failed: {e}"))?;
        if open + ctx.usd_value > self.cap_usd {
            return Err(format!(
                "strategy exposure limit (open {open:.2} + order {:.2} > cap {:.2})",
                ctx.usd_value, self.cap_usd
            ));
        }
        Ok(())
    }
}

/// Walks the top-N cached levels on the taker side; fails when depth
/// cannot absorb the order or the volume-weighted impact exceeds the
/// bound. Limit orders are price-bounded already and pass.
struct SlippageCheck {
    cache: MarketCache,
    depth: usize,
    max_impact_pct: f64,
}

#[async_trait]
impl RiskCheck for SlippageCheck {
    fn name(&self) -> &'static str {
        "slippage-probe"
    }

    async fn check(&self, ctx: &RiskContext<'_>) -> Result<(), String> {
        if ctx.signal.kind == OrderKind::Limit {
            return Ok(());
        }
        let book = self
            .cache
            .order_book(&ctx.signal.exchange, &ctx.signal.symbol)
            .await
            .map_err(|e| format!("order book read failed: {e}"))?
            .ok_or_else(|| "no cached order book for slippage probe".to_string())?;

        let levels = match ctx.signal.side {
            OrderSide::Buy => &book.asks,
            OrderSide::Sell => &book.bids,
        };
        let touch = levels
            .first()
            .map(|l| l.price)
            .ok_or_else(|| "empty order book side".to_string())?;

        let mut remaining = ctx.amount;
        let mut notional = 0.0;
        for level in levels.iter().take(self.depth) {
            let taken = remaining.min(level.size);
            notional += taken * level.price;
            remaining -= taken;
            if remaining <= 0.0 {
                break;
            }
        }
        if remaining > 0.0 {
            return Err(format!(
                "insufficient depth in top {} levels for {:.8}",
                self.depth, ctx.amount
            ));
        }

        let vwap = notional / ctx.amount;
        let impact_pct = ((vwap - touch) / touch).abs() * 100.0;
        if impact_pct > self.max_impact_pct {
            return Err(format!(
                "slippage {impact_pct:.3}% exceeds {:.3}% bound",
                self.max_impact_pct
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hot_cache::MemoryCache;
    use market_types::{BookLevel, OrderBookSnapshot};
    use std::sync::Arc;

    fn signal(amount: f64) -> TradingSignal {
        TradingSignal {
            strategy_id: 7,
            owner_id: 3,
            exchange_config_id: 1,
            exchange: "binance".into(),
            symbol: "BTC/USDT".into(),
            side: OrderSide::Buy,
            kind: OrderKind::Market,
            amount: Some(amount),
            quote_amount: None,
            limit_price: None,
            stop_loss: None,
            take_profit: None,
            leverage: None,
            state_digest: "d".into(),
            timestamp: 1_700_000_000_000,
        }
    }

    async fn cache_with_book(asks: Vec<BookLevel>) -> MarketCache {
        let cache = MarketCache::new(Arc::new(MemoryCache::new()));
        cache
            .put_order_book(&OrderBookSnapshot {
                exchange: "binance".into(),
                symbol: "BTC/USDT".into(),
                timestamp: 1,
                bids: vec![BookLevel::new(99.5, 10.0)],
                asks,
                sequence: None,
            })
            .await
            .unwrap();
        cache
    }

    #[tokio::test]
    async fn test_exposure_caps() {
        let store = TimeSeriesStore::open(":memory:").await.unwrap();
        let cache = cache_with_book(vec![BookLevel::new(100.0, 10.0)]).await;
        let config = ExecutorConfig {
            user_exposure_cap_usd: 50.0,
            ..Default::default()
        };
        let policy = RiskPolicy::standard(store, cache, &config);

        let sig = signal(0.1);
        let ok = policy
            .pre_trade_check(&RiskContext { signal: &sig, usd_value: 10.0, amount: 0.1 })
            .await;
        assert!(ok.passed);

        let rejected = policy
            .pre_trade_check(&RiskContext { signal: &sig, usd_value: 60.0, amount: 0.1 })
            .await;
        assert!(!rejected.passed);
        assert!(rejected.reason.unwrap().contains("user exposure limit"));
    }

    #[tokio::test]
    async fn test_slippage_insufficient_depth() {
        let store = TimeSeriesStore::open(":memory:").await.unwrap();
        let cache = cache_with_book(vec![BookLevel::new(100.0, 0.05)]).await;
        let policy = RiskPolicy::standard(store, cache, &ExecutorConfig::default());

        let sig = signal(1.0);
        let outcome = policy
            .pre_trade_check(&RiskContext { signal: &sig, usd_value: 100.0, amount: 1.0 })
            .await;
        assert!(!outcome.passed);
        assert!(outcome.reason.unwrap().contains("insufficient depth"));
    }

    #[tokio::test]
    async fn test_slippage_impact_bound() {
        let store = TimeSeriesStore::open(":memory:").await.unwrap();
        // second level is 5% away: a 2-unit buy pays too much
        let cache =
            cache_with_book(vec![BookLevel::new(100.0, 1.0), BookLevel::new(105.0, 10.0)]).await;
        let policy = RiskPolicy::standard(store, cache, &ExecutorConfig::default());

        let sig = signal(2.0);
        let outcome = policy
            .pre_trade_check(&RiskContext { signal: &sig, usd_value: 200.0, amount: 2.0 })
            .await;
        assert!(!outcome.passed);
        assert!(outcome.reason.unwrap().contains("slippage"));
    }

    #[tokio::test]
    async fn test_missing_book_fails_market_order() {
        let store = TimeSeriesStore::open(":memory:").await.unwrap();
        let cache = MarketCache::new(Arc::new(MemoryCache::new()));
        let policy = RiskPolicy::standard(store, cache, &ExecutorConfig::default());

        let sig = signal(0.1);
        let outcome = policy
            .pre_trade_check(&RiskContext { signal: &sig, usd_value: 10.0, amount: 0.1 })
            .await;
        assert!(!outcome.passed);
    }
}
