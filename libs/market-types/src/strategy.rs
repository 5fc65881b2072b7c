//! Strategy instances and their typed parameter records.

use serde::{Deserialize, Serialize};

use crate::{Result, ValidationError};

/// Engine-owned lifecycle status of a strategy instance.
///
/// `pending_start -> running -> (paused | error | stopped)`. `error` goes
/// back to `pending_start` when the owner flips desired-active off then on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyStatus {
    PendingStart,
    Running,
    Paused,
    Stopped,
    Error,
}

impl StrategyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::PendingStart => "pending_start",
            StrategyStatus::Running => "running",
            StrategyStatus::Paused => "paused",
            StrategyStatus::Stopped => "stopped",
            StrategyStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_start" => Some(StrategyStatus::PendingStart),
            "running" => Some(StrategyStatus::Running),
            "paused" => Some(StrategyStatus::Paused),
            "stopped" => Some(StrategyStatus::Stopped),
            "error" => Some(StrategyStatus::Error),
            _ => None,
        }
    }
}

/// Typed parameters per strategy kind.
///
/// Unknown kinds are rejected when the instance is loaded, not discovered
/// at evaluation time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyParams {
    /// Trade against top-of-book volume imbalance.
    OrderbookImbalance {
        /// Levels per side to sum.
        depth: usize,
        /// Bid share above which to buy, e.g. 0.65.
        buy_threshold: f64,
        /// Bid share below which to sell, e.g. 0.35.
        sell_threshold: f64,
        /// Base amount per signal.
        order_size: f64,
    },
    /// Follow the sign of recent aggregate taker flow.
    FootprintMomentum {
        /// How many cached trades to fold.
        lookback_trades: usize,
        /// Minimum absolute delta (base units) before signalling.
        min_delta: f64,
        /// Base amount per signal.
        order_size: f64,
    },
}

impl StrategyParams {
    pub fn kind(&self) -> &'static str {
        match self {
            StrategyParams::OrderbookImbalance { .. } => "orderbook_imbalance",
            StrategyParams::FootprintMomentum { .. } => "footprint_momentum",
        }
    }

    /// Parse a raw JSON parameter map, rejecting unknown kinds.
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            let kind = serde_json::from_str::<serde_json::Value>(raw)
                .ok()
                .and_then(|v| v.get("kind").and_then(|k| k.as_str().map(String::from)))
                .unwrap_or_else(|| e.to_string());
            ValidationError::UnknownStrategyKind(kind)
        })
    }
}

/// A user-configured strategy with engine-owned runtime status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyInstance {
    pub id: i64,
    pub owner_id: i64,
    pub exchange_config_id: i64,
    /// Unique per owner.
    pub name: String,
    pub exchange: String,
    pub symbol: String,
    pub params: StrategyParams,
    /// Owner-controlled: whether this instance should run.
    pub desired_active: bool,
    /// Engine-controlled runtime status.
    pub status: StrategyStatus,
    /// Most recent user-relevant reason, e.g. a failed risk check.
    pub health_message: Option<String>,
    pub last_eval_at: Option<i64>,
    pub consecutive_errors: u32,
    /// Opaque per-strategy state carried across evaluations.
    pub state: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_params_round_trip() {
        let params = StrategyParams::OrderbookImbalance {
            depth: 5,
            buy_threshold: 0.65,
            sell_threshold: 0.35,
            order_size: 0.1,
        };
        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("orderbook_imbalance"));
        assert_eq!(StrategyParams::from_json(&json).unwrap(), params);
    }

    #[test]
    fn test_unknown_kind_rejected_at_load() {
        let raw = r#"{"kind":"martingale","order_size":1.0}"#;
        match StrategyParams::from_json(raw) {
            Err(ValidationError::UnknownStrategyKind(kind)) => assert_eq!(kind, "martingale"),
            other => panic!("expected unknown-kind error, got {other:?}"),
        }
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(StrategyStatus::parse("pending_start"), Some(StrategyStatus::PendingStart));
        assert_eq!(StrategyStatus::parse("bogus"), None);
    }
}
