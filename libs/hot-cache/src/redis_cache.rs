//! Redis cache backend using the auto-reconnecting connection manager.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::info;

use crate::{HotCache, Result};

/// Shared-deployment backend. TTLs map to Redis key expiry; capped lists
/// are `RPUSH` + `LTRIM`.
pub struct RedisCache {
    manager: ConnectionManager,
}

impl RedisCache {
    /// Connect to `redis://host:port/db`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(crate::CacheError::from)?;
        let manager = ConnectionManager::new(client).await?;
        info!(url, "connected to redis hot cache");
        Ok(Self { manager })
    }

    fn ttl_secs(ttl: Duration) -> i64 {
        ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl HotCache for RedisCache {
    async fn put_map(&self, key: &str, fields: Vec<(String, String)>, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("DEL").arg(key).ignore();
        let mut hset = redis::cmd("HSET");
        hset.arg(key);
        for (field, value) in &fields {
            hset.arg(field).arg(value);
        }
        pipe.add_command(hset).ignore();
        pipe.cmd("EXPIRE").arg(key).arg(Self::ttl_secs(ttl)).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn read_map(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;
        Ok(if map.is_empty() { None } else { Some(map) })
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("RPUSH").arg(key).arg(value).ignore();
        pipe.cmd("LTRIM").arg(key).arg(-(cap as i64)).arg(-1).ignore();
        pipe.cmd("EXPIRE").arg(key).arg(Self::ttl_secs(ttl)).ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let list: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(list)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL").arg(key).query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
