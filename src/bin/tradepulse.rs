use std::sync::Arc;
use std::time::Duration;

use exchange_core::{BinanceAdapter, CredentialVault, ExchangeAdapter, PaperExchange, SecretCipher, StoreVault};
use hot_cache::{HotCache, MemoryCache, RedisCache};
use market_bus::MessageBus;
use market_store::TimeSeriesStore;
use tradepulse_backend::trade_pipeline::{
    AdapterRegistry, LogNotifier, PipelineApp, PipelineConfig,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_target(false)
        .init();

    info!("tradepulse backend starting");

    // Load configuration
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());
    let config = if std::path::Path::new(&config_path).exists() {
        PipelineConfig::load(&config_path)?
    } else {
        warn!(%config_path, "config file missing, using defaults");
        let mut config = PipelineConfig::default();
        config.apply_env_overrides();
        config
    };

    // Durable store
    let store = TimeSeriesStore::open(&config.database.path).await?;
    info!(path = %config.database.path, "time-series store ready");

    // Hot cache
    let cache: Arc<dyn HotCache> = match config.cache.backend.as_str() {
        "redis" => Arc::new(RedisCache::connect(&config.cache.redis_url).await?),
        _ => Arc::new(MemoryCache::new()),
    };
    info!(backend = %config.cache.backend, "hot cache ready");

    // Bus
    let bus = MessageBus::new();

    // Exchange adapters; credentials decrypt only inside the adapter layer
    let cipher = match std::env::var("CREDENTIAL_KEY") {
        Ok(hex_key) => SecretCipher::from_hex(&hex_key).map_err(|e| anyhow::anyhow!("{e}"))?,
        Err(_) => {
            warn!("CREDENTIAL_KEY not set, using an ephemeral key (stored credentials unreadable)");
            SecretCipher::from_key(&rand::random::<[u8; 32]>())
        }
    };
    let vault: Arc<dyn CredentialVault> = Arc::new(StoreVault::new(store.clone(), cipher));

    let mut adapters: std::collections::HashMap<String, Arc<dyn ExchangeAdapter>> =
        std::collections::HashMap::new();
    let binance = BinanceAdapter::with_endpoints(
        Arc::clone(&vault),
        "https://fapi.binance.com",
        "wss://fstream.binance.com",
        Duration::from_millis(config.adapter.request_timeout_ms),
        Duration::from_millis(config.adapter.client_ttl_ms),
    )
    .map_err(|e| anyhow::anyhow!("{e}"))?;
    adapters.insert("binance".to_string(), Arc::new(binance));

    let paper = PaperExchange::new("paper");
    adapters.insert("paper".to_string(), Arc::new(paper));

    // Start the pipeline, leaves first
    let running = PipelineApp::start(
        config,
        store,
        cache,
        bus,
        AdapterRegistry::new(adapters),
        Arc::new(LogNotifier),
    )
    .await?;

    info!("pipeline running, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    running.shutdown(Duration::from_secs(10)).await;
    info!("bye");
    Ok(())
}
