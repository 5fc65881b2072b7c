//! In-process cache backend on dashmap with lazy TTL expiry.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::{HotCache, Result};

enum Value {
    Map(HashMap<String, String>),
    List(VecDeque<String>),
}

struct Entry {
    expires_at: Instant,
    value: Value,
}

impl Entry {
    fn expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Default backend: no external service, entries expire lazily on access.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired entries eagerly. Called opportunistically; reads do
    /// not depend on it.
    pub fn purge_expired(&self) {
        self.entries.retain(|_, entry| !entry.expired());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl HotCache for MemoryCache {
    async fn put_map(&self, key: &str, fields: Vec<(String, String)>, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            Entry {
                expires_at: Instant::now() + ttl,
                value: Value::Map(fields.into_iter().collect()),
            },
        );
        Ok(())
    }

    async fn read_map(&self, key: &str) -> Result<Option<HashMap<String, String>>> {
        match self.entries.get(key) {
            Some(entry) if !entry.expired() => match &entry.value {
                Value::Map(map) => Ok(Some(map.clone())),
                Value::List(_) => Ok(None),
            },
            _ => Ok(None),
        }
    }

    async fn push_capped(&self, key: &str, value: String, cap: usize, ttl: Duration) -> Result<()> {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            expires_at: Instant::now() + ttl,
            value: Value::List(VecDeque::new()),
        });
        if entry.expired() || !matches!(entry.value, Value::List(_)) {
            entry.value = Value::List(VecDeque::new());
        }
        entry.expires_at = Instant::now() + ttl;
        if let Value::List(list) = &mut entry.value {
            list.push_back(value);
            while list.len() > cap {
                list.pop_front();
            }
        }
        Ok(())
    }

    async fn list(&self, key: &str) -> Result<Vec<String>> {
        match self.entries.get(key) {
            Some(entry) if !entry.expired() => match &entry.value {
                Value::List(list) => Ok(list.iter().cloned().collect()),
                Value::Map(_) => Ok(Vec::new()),
            },
            _ => Ok(Vec::new()),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_map_put_read() {
        let cache = MemoryCache::new();
        cache
            .put_map(
                "k",
                vec![("a".into(), "1".into()), ("b".into(), "2".into())],
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let map = cache.read_map("k").await.unwrap().unwrap();
        assert_eq!(map.get("a").unwrap(), "1");
        assert_eq!(map.get("b").unwrap(), "2");
    }

    #[tokio::test]
    async fn test_map_expires() {
        let cache = MemoryCache::new();
        cache
            .put_map("k", vec![("a".into(), "1".into())], Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(cache.read_map("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_capped_list_keeps_newest() {
        let cache = MemoryCache::new();
        for i in 0..5 {
            cache
                .push_capped("l", format!("v{i}"), 3, Duration::from_secs(60))
                .await
                .unwrap();
        }
        let list = cache.list("l").await.unwrap();
        assert_eq!(list, vec!["v2", "v3", "v4"]);
    }

    #[tokio::test]
    async fn test_push_appends_newest_last() {
        let cache = MemoryCache::new();
        cache.push_capped("l", "old".into(), 10, Duration::from_secs(60)).await.unwrap();
        cache.push_capped("l", "new".into(), 10, Duration::from_secs(60)).await.unwrap();
        let list = cache.list("l").await.unwrap();
        assert_eq!(list.last().unwrap(), "new");
    }

    #[tokio::test]
    async fn test_delete_and_purge() {
        let cache = MemoryCache::new();
        cache
            .put_map("gone", vec![("a".into(), "1".into())], Duration::from_millis(5))
            .await
            .unwrap();
        cache
            .put_map("kept", vec![("a".into(), "1".into())], Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;
        cache.purge_expired();
        assert_eq!(cache.len(), 1);

        cache.delete("kept").await.unwrap();
        assert!(cache.is_empty());
    }
}
