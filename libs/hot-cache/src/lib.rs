//! Low-latency, short-TTL key-value store for live market state.
//!
//! Two primitives cover everything the pipeline needs: TTL'd field maps
//! (order books, tickers) and TTL'd capped lists (recent trades). The
//! in-memory backend is the default for tests and single-process runs;
//! the Redis backend is for shared deployments. Components receive the
//! cache as a shared handle created once at startup.

mod market;
mod memory;
mod redis_cache;

pub use market::MarketCache;
pub use memory::MemoryCache;
pub use redis_cache::RedisCache;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<redis::RedisError> for CacheError {
    fn from(err: redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Backend-agnostic hot cache operations.
#[async_trait]
pub trait HotCache: Send + Sync {
    /// Replace the field map at `key`, refreshing its TTL.
    async fn put_map(&self, key: &str, fields: Vec<(String, String)>, ttl: Duration) -> Result<()>;

    /// Read the field map at `key`, or `None` if absent or expired.
    async fn read_map(&self, key: &str) -> Result<Option<HashMap<String, String>>>;

    /// Append to the list at `key`, keeping at most `cap` newest entries
    /// and refreshing the TTL.
    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()>;

    /// Full list at `key`, oldest first. Empty if absent or expired.
    async fn list(&self, key: &str) -> Result<Vec<String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}
