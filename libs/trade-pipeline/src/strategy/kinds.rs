//! Decision logic per strategy kind, pure over cached market state.

use market_types::{AggressorSide, OrderBookSnapshot, OrderSide, StrategyParams, TickerSnapshot, TradeEvent};

/// Market state handed to an evaluation; everything comes from the hot
/// cache, never from direct exchange calls.
#[derive(Debug, Default)]
pub struct EvalContext {
    pub order_book: Option<OrderBookSnapshot>,
    pub recent_trades: Vec<TradeEvent>,
    pub ticker: Option<TickerSnapshot>,
}

/// Result of one evaluation tick.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Required market data missing; not an error.
    Skipped,
    Hold,
    Trade {
        side: OrderSide,
        amount: f64,
        stop_loss: Option<f64>,
        take_profit: Option<f64>,
    },
}

/// Evaluate `params` against `ctx`. An `Err` counts toward the
/// strategy's consecutive-error budget.
pub fn evaluate(params: &StrategyParams, ctx: &EvalContext) -> Result<Evaluation, String> {
    match params {
        StrategyParams::OrderbookImbalance {
            depth,
            buy_threshold,
            sell_threshold,
            order_size,
        } => {
            if *depth == 0 {
                return Err("depth must be > 0".into());
            }
            if *order_size <= 0.0 {
                return Err("order_size must be > 0".into());
            }
            let Some(book) = &ctx.order_book else {
                return Ok(Evaluation::Skipped);
            };
            let bid_volume: f64 = book.bids.iter().take(*depth).map(|l| l.size).sum();
            let ask_volume: f64 = book.asks.iter().take(*depth).map(|l| l.size).sum();
            let total = bid_volume + ask_volume;
            if total <= 0.0 {
                return Ok(Evaluation::Skipped);
            }
            let ratio = bid_volume / total;
            if ratio >= *buy_threshold {
                Ok(Evaluation::Trade {
                    side: OrderSide::Buy,
                    amount: *order_size,
                    stop_loss: None,
                    take_profit: None,
                })
            } else if ratio <= *sell_threshold {
                Ok(Evaluation::Trade {
                    side: OrderSide::Sell,
                    amount: *order_size,
                    stop_loss: None,
                    take_profit: None,
                })
            } else {
                Ok(Evaluation::Hold)
            }
        }
        StrategyParams::FootprintMomentum {
            lookback_trades,
            min_delta,
            order_size,
        } => {
            if *lookback_trades == 0 {
                return Err("lookback_trades must be > 0".into());
            }
            if *order_size <= 0.0 {
                return Err("order_size must be > 0".into());
            }
            if ctx.recent_trades.is_empty() {
                return Ok(Evaluation::Skipped);
            }
            let window = ctx
                .recent_trades
                .iter()
                .rev()
                .take(*lookback_trades);
            let delta: f64 = window
                .map(|trade| match trade.side {
                    AggressorSide::Buy => trade.quantity,
                    AggressorSide::Sell => -trade.quantity,
                    AggressorSide::Unknown => 0.0,
                })
                .sum();
            if delta >= *min_delta {
                Ok(Evaluation::Trade {
                    side: OrderSide::Buy,
                    amount: *order_size,
                    stop_loss: None,
                    take_profit: None,
                })
            } else if delta <= -*min_delta {
                Ok(Evaluation::Trade {
                    side: OrderSide::Sell,
                    amount: *order_size,
                    stop_loss: None,
                    take_profit: None,
                })
            } else {
                Ok(Evaluation::Hold)
            }
        }
    }
}
