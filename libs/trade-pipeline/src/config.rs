//! Pipeline configuration: YAML file plus environment overrides.
//!
//! Every recognized option has a default, so an empty file (or no file)
//! yields a runnable configuration.

use std::path::Path;

use market_types::SubscriptionKind;
use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub feed: FeedConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// `memory` or `redis`.
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: default_redis_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeedConfig {
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_connection_check_interval_ms")]
    pub connection_check_interval_ms: u64,
    #[serde(default = "default_publish_retry_limit")]
    pub publish_retry_limit: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: default_reconnect_delay_ms(),
            connection_check_interval_ms: default_connection_check_interval_ms(),
            publish_retry_limit: default_publish_retry_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AggregatorConfig {
    #[serde(default = "default_footprint_interval_ms")]
    pub interval_ms: i64,
    /// Used when a symbol has no registered tick size.
    #[serde(default = "default_price_bucket_tick")]
    pub fallback_price_tick: f64,
    /// A bar is finalized once `end_time + grace` is in the past.
    #[serde(default = "default_finalize_grace_ms")]
    pub finalize_grace_ms: i64,
    /// Sweeper cadence; defaults to a quarter of the bar interval.
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
    #[serde(default = "default_value_area_ratio")]
    pub value_area_ratio: f64,
    #[serde(default = "default_imbalance_ratio")]
    pub imbalance_ratio: f64,
}

impl AggregatorConfig {
    pub fn sweep_interval_ms(&self) -> u64 {
        self.sweep_interval_ms.unwrap_or((self.interval_ms / 4).max(1) as u64)
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_footprint_interval_ms(),
            fallback_price_tick: default_price_bucket_tick(),
            finalize_grace_ms: default_finalize_grace_ms(),
            sweep_interval_ms: None,
            value_area_ratio: default_value_area_ratio(),
            imbalance_ratio: default_imbalance_ratio(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StrategyConfig {
    #[serde(default = "default_manager_interval_ms")]
    pub manager_interval_ms: u64,
    #[serde(default = "default_eval_interval_ms")]
    pub eval_interval_ms: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            manager_interval_ms: default_manager_interval_ms(),
            eval_interval_ms: default_eval_interval_ms(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    #[serde(default = "default_order_place_retries")]
    pub order_place_retries: u32,
    #[serde(default = "default_user_exposure_cap")]
    pub user_exposure_cap_usd: f64,
    #[serde(default = "default_strategy_exposure_cap")]
    pub strategy_exposure_cap_usd: f64,
    #[serde(default = "default_slippage_depth")]
    pub slippage_depth: usize,
    #[serde(default = "default_max_slippage_pct")]
    pub max_slippage_pct: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            order_place_retries: default_order_place_retries(),
            user_exposure_cap_usd: default_user_exposure_cap(),
            strategy_exposure_cap_usd: default_strategy_exposure_cap(),
            slippage_depth: default_slippage_depth(),
            max_slippage_pct: default_max_slippage_pct(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OracleConfig {
    #[serde(default = "default_oracle_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_slippage_depth")]
    pub depth: usize,
    #[serde(default = "default_buy_threshold")]
    pub buy_threshold: f64,
    #[serde(default = "default_sell_threshold")]
    pub sell_threshold: f64,
    #[serde(default)]
    pub watch_list: Vec<WatchedMarket>,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_oracle_interval_ms(),
            depth: default_slippage_depth(),
            buy_threshold: default_buy_threshold(),
            sell_threshold: default_sell_threshold(),
            watch_list: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct WatchedMarket {
    pub exchange: String,
    pub symbol: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterConfig {
    #[serde(default = "default_adapter_ttl_ms")]
    pub client_ttl_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            client_ttl_ms: default_adapter_ttl_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionConfig {
    pub exchange: String,
    pub symbol: String,
    pub kind: SubscriptionKind,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Registered into the symbol table at startup.
    #[serde(default = "default_price_bucket_tick")]
    pub price_tick: f64,
}

impl PipelineConfig {
    /// Parse the YAML file at `path`, then apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Recognized overrides, matching the option names operators know.
    pub fn apply_env_overrides(&mut self) {
        override_u64("RECONNECT_DELAY_MS", &mut self.feed.reconnect_delay_ms);
        override_u64(
            "CONNECTION_CHECK_INTERVAL_MS",
            &mut self.feed.connection_check_interval_ms,
        );
        override_i64("FOOTPRINT_INTERVAL_MS", &mut self.aggregator.interval_ms);
        override_f64("PRICE_BUCKET_TICK", &mut self.aggregator.fallback_price_tick);
        override_u64("STRATEGY_EVAL_INTERVAL_MS", &mut self.strategy.eval_interval_ms);
        override_u32("MAX_CONSECUTIVE_ERRORS", &mut self.strategy.max_consecutive_errors);
        override_u32("ORDER_PLACE_RETRIES", &mut self.executor.order_place_retries);
        override_u64("ADAPTER_TTL_MS", &mut self.adapter.client_ttl_ms);
        override_u64("ORACLE_INTERVAL_MS", &mut self.oracle.interval_ms);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.aggregator.interval_ms <= 0 {
            return Err(ConfigError::Invalid("aggregator.interval_ms must be > 0".into()));
        }
        if self.aggregator.fallback_price_tick <= 0.0 {
            return Err(ConfigError::Invalid("aggregator.fallback_price_tick must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.aggregator.value_area_ratio) {
            return Err(ConfigError::Invalid("aggregator.value_area_ratio must be in [0, 1]".into()));
        }
        match self.cache.backend.as_str() {
            "memory" | "redis" => {}
            other => {
                return Err(ConfigError::Invalid(format!("cache.backend '{other}' not recognized")))
            }
        }
        Ok(())
    }
}

fn override_u64(name: &str, target: &mut u64) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

fn override_i64(name: &str, target: &mut i64) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

fn override_u32(name: &str, target: &mut u32) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

fn override_f64(name: &str, target: &mut f64) {
    if let Ok(raw) = std::env::var(name) {
        if let Ok(value) = raw.parse() {
            *target = value;
        }
    }
}

fn default_db_path() -> String {
    "tradepulse.db".to_string()
}
fn default_cache_backend() -> String {
    "memory".to_string()
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}
fn default_reconnect_delay_ms() -> u64 {
    15_000
}
fn default_connection_check_interval_ms() -> u64 {
    60_000
}
fn default_publish_retry_limit() -> u32 {
    5
}
fn default_footprint_interval_ms() -> i64 {
    60_000
}
fn default_price_bucket_tick() -> f64 {
    0.5
}
fn default_finalize_grace_ms() -> i64 {
    1_000
}
fn default_value_area_ratio() -> f64 {
    0.7
}
fn default_imbalance_ratio() -> f64 {
    3.0
}
fn default_manager_interval_ms() -> u64 {
    10_000
}
fn default_eval_interval_ms() -> u64 {
    60_000
}
fn default_max_consecutive_errors() -> u32 {
    5
}
fn default_order_place_retries() -> u32 {
    3
}
fn default_user_exposure_cap() -> f64 {
    100_000.0
}
fn default_strategy_exposure_cap() -> f64 {
    10_000.0
}
fn default_slippage_depth() -> usize {
    5
}
fn default_max_slippage_pct() -> f64 {
    1.0
}
fn default_oracle_interval_ms() -> u64 {
    30_000
}
fn default_buy_threshold() -> f64 {
    0.65
}
fn default_sell_threshold() -> f64 {
    0.35
}
fn default_adapter_ttl_ms() -> u64 {
    300_000
}
fn default_request_timeout_ms() -> u64 {
    30_000
}
fn default_true() -> bool {
    true
}
