//! In-memory KV backend.
//!
//! Thread-safe via `DashMap`; expiry is checked at read time, with a
//! `cleanup_expired` sweep for long-running processes. Used by tests, the
//! demo binary, and anywhere a real Redis is not wired in.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::KvError;
use crate::kv::KvStore;

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

#[derive(Debug, Clone)]
struct ListEntry {
    items: Vec<Value>,
    expires_at: Option<Instant>,
}

impl ListEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Instant::now())
    }
}

/// In-memory [`KvStore`] implementation.
#[derive(Debug, Default)]
pub struct MemoryKv {
    values: DashMap<String, Entry>,
    lists: DashMap<String, ListEntry>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (non-expired) value keys.
    pub fn len(&self) -> usize {
        self.values.iter().filter(|e| !e.value().is_expired()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired value and list. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let before = self.values.len() + self.lists.len();
        self.values.retain(|_, entry| !entry.is_expired());
        self.lists.retain(|_, entry| !entry.is_expired());
        before - (self.values.len() + self.lists.len())
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        match self.values.get(key) {
            Some(entry) if !entry.is_expired() => Ok(Some(entry.value.clone())),
            _ => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        self.values.insert(key.to_string(), Entry::new(value, ttl));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.values.remove(key).is_some())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .values
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && !entry.value().is_expired())
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        // The entry API holds the shard lock, making read-add-write atomic.
        let mut entry = self
            .values
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::from(0i64), None));
        if entry.is_expired() {
            *entry = Entry::new(Value::from(0i64), None);
        }
        let current = entry.value.as_i64().ok_or_else(|| KvError::NotACounter {
            key: key.to_string(),
        })?;
        let next = current + delta;
        entry.value = Value::from(next);
        Ok(next)
    }

    async fn list_push(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut entry = self.lists.entry(key.to_string()).or_insert_with(|| ListEntry {
            items: Vec::new(),
            expires_at: None,
        });
        if entry.is_expired() {
            entry.items.clear();
        }
        entry.items.push(value);
        entry.expires_at = ttl.map(|t| Instant::now() + t);
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Value>, KvError> {
        match self.lists.get_mut(key) {
            Some(mut entry) if !entry.is_expired() => Ok(entry.items.pop()),
            _ => Ok(None),
        }
    }

    async fn list_delete(&self, key: &str) -> Result<bool, KvError> {
        Ok(self.lists.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn get_missing_key_returns_none() {
        let kv = MemoryKv::new();
        assert_eq!(kv.get("nope").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let kv = MemoryKv::new();
        kv.set("k", json!({"a": 1}), None).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn expired_value_reads_as_absent() {
        let kv = MemoryKv::new();
        kv.set("k", json!(1), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let kv = MemoryKv::new();
        kv.set("k", json!(1), None).await.unwrap();
        assert!(kv.delete("k").await.unwrap());
        assert!(!kv.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn keys_with_prefix_filters() {
        let kv = MemoryKv::new();
        kv.set("job-a", json!(1), None).await.unwrap();
        kv.set("job-b", json!(2), None).await.unwrap();
        kv.set("other", json!(3), None).await.unwrap();
        let mut keys = kv.keys_with_prefix("job-").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["job-a", "job-b"]);
    }

    #[tokio::test]
    async fn incr_initializes_and_adds() {
        let kv = MemoryKv::new();
        assert_eq!(kv.incr("n", 2).await.unwrap(), 2);
        assert_eq!(kv.incr("n", 3).await.unwrap(), 5);
        assert_eq!(kv.incr("n", -5).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn incr_rejects_non_counter_value() {
        let kv = MemoryKv::new();
        kv.set("k", json!("text"), None).await.unwrap();
        assert!(matches!(
            kv.incr("k", 1).await,
            Err(KvError::NotACounter { .. })
        ));
    }

    #[tokio::test]
    async fn incr_is_atomic_under_concurrency() {
        let kv = std::sync::Arc::new(MemoryKv::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let kv = kv.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    kv.incr("counter", 1).await.unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(kv.get("counter").await.unwrap(), Some(json!(800)));
    }

    #[tokio::test]
    async fn list_is_lifo() {
        let kv = MemoryKv::new();
        kv.list_push("s", json!(1), None).await.unwrap();
        kv.list_push("s", json!(2), None).await.unwrap();
        assert_eq!(kv.list_pop("s").await.unwrap(), Some(json!(2)));
        assert_eq!(kv.list_pop("s").await.unwrap(), Some(json!(1)));
        assert_eq!(kv.list_pop("s").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_delete_drops_all_items() {
        let kv = MemoryKv::new();
        kv.list_push("s", json!(1), None).await.unwrap();
        assert!(kv.list_delete("s").await.unwrap());
        assert_eq!(kv.list_pop("s").await.unwrap(), None);
        assert!(!kv.list_delete("s").await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_expired_sweeps() {
        let kv = MemoryKv::new();
        kv.set("short", json!(1), Some(Duration::from_millis(5)))
            .await
            .unwrap();
        kv.set("long", json!(2), None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.cleanup_expired(), 1);
        assert_eq!(kv.len(), 1);
    }
}
