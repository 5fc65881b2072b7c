//! Footprint candles: per-bar order-flow aggregates.

use serde::{Deserialize, Serialize};

/// Bid/ask volume accumulated at one price bucket inside a bar.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBucket {
    /// Lower edge of the bucket: `floor(price / tick) * tick`.
    pub price: f64,
    /// Volume where the seller was the aggressor (hit the bid).
    pub bid_volume: f64,
    /// Volume where the buyer was the aggressor (lifted the ask).
    pub ask_volume: f64,
    /// `ask_volume - bid_volume`.
    pub delta: f64,
    /// Diagonal 3x dominance of ask volume here over bid volume one tick below.
    pub ask_imbalance: bool,
    /// Diagonal 3x dominance of bid volume here over ask volume one tick above.
    pub bid_imbalance: bool,
}

/// A closed fixed-interval bar enriched with per-price bid/ask volume.
///
/// Invariants on emission:
/// - `end_time = start_time + interval - 1ms`
/// - `total_volume = Σ (bid_volume + ask_volume)` over buckets plus any
///   volume whose aggressor could not be attributed
/// - `total_delta = Σ (ask_volume - bid_volume)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FootprintCandle {
    pub exchange: String,
    pub symbol: String,
    pub symbol_id: i64,
    /// Bar length in milliseconds.
    pub interval_ms: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub total_volume: f64,
    pub total_delta: f64,
    /// Price bucket with the highest traded volume; ties resolve to the
    /// lower price.
    pub poc_price: f64,
    pub value_area_high: f64,
    pub value_area_low: f64,
    /// Buckets sorted ascending by price.
    pub buckets: Vec<PriceBucket>,
}

impl FootprintCandle {
    /// Bar start for a trade timestamp: `floor(ts / interval) * interval`.
    pub fn bar_start(timestamp: i64, interval_ms: i64) -> i64 {
        timestamp.div_euclid(interval_ms) * interval_ms
    }

    /// Interval label used in topic names and the store, e.g. `1m` for 60s.
    pub fn interval_label(interval_ms: i64) -> String {
        if interval_ms % 60_000 == 0 {
            format!("{}m", interval_ms / 60_000)
        } else {
            format!("{}s", interval_ms / 1000)
        }
    }
}
