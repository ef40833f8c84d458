//! Backing key-value store contract.
//!
//! Everything durable in the core (shared data, result records, schedule
//! entries) goes through [`KvStore`]. Backends are dumb stores: no domain
//! logic, only keys, JSON values, TTLs, prefix scans, and LIFO lists.

mod memory;
#[cfg(feature = "redis-backend")]
mod redis;

pub use memory::MemoryKv;
#[cfg(feature = "redis-backend")]
pub use redis::RedisKv;

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::KvError;

/// Key-value store consumed as a durable side channel.
///
/// Implementations must be `Send + Sync`; every concurrent invocation in
/// the process shares one store behind an `Arc<dyn KvStore>`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read the value at `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError>;

    /// Write `value` at `key`. A `ttl` of `None` keeps the key until
    /// deleted; `Some` sets/refreshes the expiry window.
    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError>;

    /// Delete `key`. Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// All live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError>;

    /// Atomically add `delta` to the integer counter at `key`,
    /// initializing a missing key to zero first. Returns the new value.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError>;

    /// Push `value` onto the LIFO list at `key`, refreshing `ttl`.
    async fn list_push(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError>;

    /// Pop the most recently pushed value, or `None` if the list is
    /// empty or absent.
    async fn list_pop(&self, key: &str) -> Result<Option<Value>, KvError>;

    /// Delete the whole list at `key`. Returns whether it existed.
    async fn list_delete(&self, key: &str) -> Result<bool, KvError>;
}
