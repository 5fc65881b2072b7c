//! Per-credential compiled client cache with TTL.
//!
//! Rebuilding a client refreshes signing state (nonces, session tokens);
//! the 5 minute default TTL matches how long exchanges tolerate stale
//! sessions.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::Result;

pub const DEFAULT_CLIENT_TTL: Duration = Duration::from_secs(300);

struct CachedClient<C> {
    client: Arc<C>,
    built_at: Instant,
}

pub struct ClientCache<C> {
    ttl: Duration,
    clients: DashMap<i64, CachedClient<C>>,
}

impl<C> ClientCache<C> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            clients: DashMap::new(),
        }
    }

    /// Cached client for `credential_id`, or build (and cache) a fresh one.
    pub async fn get_or_build<F, Fut>(&self, credential_id: i64, build: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C>>,
    {
        if let Some(entry) = self.clients.get(&credential_id) {
            if entry.built_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&entry.client));
            }
        }

        let client = Arc::new(build().await?);
        self.clients.insert(
            credential_id,
            CachedClient {
                client: Arc::clone(&client),
                built_at: Instant::now(),
            },
        );
        Ok(client)
    }

    /// Drop a cached client, forcing a rebuild on next use.
    pub fn invalidate(&self, credential_id: i64) {
        self.clients.remove(&credential_id);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_reuses_client_within_ttl() {
        let cache: ClientCache<u32> = ClientCache::new(Duration::from_secs(60));
        let builds = AtomicU32::new(0);

        for _ in 0..3 {
            let client = cache
                .get_or_build(1, || async {
                    builds.fetch_add(1, Ordering::SeqCst);
                    Ok(42u32)
                })
                .await
                .unwrap();
            assert_eq!(*client, 42);
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rebuilds_after_ttl() {
        let cache: ClientCache<u32> = ClientCache::new(Duration::from_millis(10));
        let builds = AtomicU32::new(0);

        cache
            .get_or_build(1, || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(1u32)
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        cache
            .get_or_build(1, || async {
                builds.fetch_add(1, Ordering::SeqCst);
                Ok(2u32)
            })
            .await
            .unwrap();

        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rebuild() {
        let cache: ClientCache<u32> = ClientCache::new(Duration::from_secs(60));
        cache.get_or_build(1, || async { Ok(1u32) }).await.unwrap();
        cache.invalidate(1);
        assert!(cache.is_empty());
    }
}
