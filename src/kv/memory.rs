//! In-process KV (USE_LOCAL_MEMORY_STORE)

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::KvStore;
use crate::error::{ApiError, ApiResult};

struct Entry {
    value: String,
    expires_at: Instant,
}

/// 만료는 접근 시점에 lazy 하게 처리
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> ApiResult<T> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ApiError::internal(anyhow::anyhow!("memory store lock poisoned")))?;
        let now = Instant::now();
        entries.retain(|_, e| e.expires_at > now);
        Ok(f(&mut entries))
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> ApiResult<bool> {
        self.with_entries(|entries| {
            if entries.contains_key(key) {
                return false;
            }
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
            true
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> ApiResult<()> {
        self.with_entries(|entries| {
            entries.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: Instant::now() + ttl,
                },
            );
        })
    }

    async fn replace(&self, key: &str, value: &str) -> ApiResult<bool> {
        self.with_entries(|entries| match entries.get_mut(key) {
            Some(entry) => {
                entry.value = value.to_string();
                true
            }
            None => false,
        })
    }

    async fn get(&self, key: &str) -> ApiResult<Option<String>> {
        self.with_entries(|entries| entries.get(key).map(|e| e.value.clone()))
    }

    async fn get_del(&self, key: &str) -> ApiResult<Option<String>> {
        self.with_entries(|entries| entries.remove(key).map(|e| e.value))
    }

    async fn del(&self, key: &str) -> ApiResult<bool> {
        self.with_entries(|entries| entries.remove(key).is_some())
    }

    async fn ping(&self) -> ApiResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_nx_is_exclusive() {
        let store = MemoryStore::new();
        assert!(store.set_nx("k", "a", Duration::from_secs(10)).await.unwrap());
        assert!(!store.set_nx("k", "b", Duration::from_secs(10)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.unwrap().is_none());
        // 만료 후에는 다시 set_nx 가능
        assert!(store.set_nx("k", "w", Duration::from_secs(5)).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_del_consumes_once() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.get_del("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.get_del("k").await.unwrap().is_none());
        assert!(!store.replace("k", "x").await.unwrap());
    }
}
