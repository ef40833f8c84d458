//! Redis KV backend (feature `redis-backend`).
//!
//! Values are stored as serialized JSON strings; TTLs map to `SET .. EX` /
//! `EXPIRE`, the shared stacks to `LPUSH`/`LPOP`, and counters to `INCRBY`.

use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::AsyncCommands;
use async_trait::async_trait;
use serde_json::Value;

use crate::error::KvError;
use crate::kv::KvStore;

/// Redis-backed [`KvStore`].
///
/// Holds a [`MultiplexedConnection`], which is cheap to clone: all clones
/// share one underlying TCP connection. Each operation clones it for
/// concurrent safety.
#[derive(Clone)]
pub struct RedisKv {
    conn: MultiplexedConnection,
}

impl RedisKv {
    /// Connect to Redis at `url` (e.g. `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let client =
            ::redis::Client::open(url).map_err(|e| KvError::Backend(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| KvError::Backend(e.to_string()))?;
        Ok(Self { conn })
    }

    /// Wrap an existing multiplexed connection.
    pub fn with_connection(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }
}

fn map_err(err: ::redis::RedisError, key: &str) -> KvError {
    if err.kind() == ::redis::ErrorKind::TypeError {
        KvError::NotACounter {
            key: key.to_string(),
        }
    } else {
        KvError::Backend(format!("{key}: {err}"))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Value>, KvError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(key).await.map_err(|e| map_err(e, key))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(&value)?;
        match ttl {
            Some(ttl) => conn
                .set_ex::<_, _, ()>(key, raw, ttl.as_secs().max(1))
                .await
                .map_err(|e| map_err(e, key))?,
            None => conn
                .set::<_, _, ()>(key, raw)
                .await
                .map_err(|e| map_err(e, key))?,
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(|e| map_err(e, key))?;
        Ok(removed > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let keys: Vec<String> = conn
            .keys(&pattern)
            .await
            .map_err(|e| map_err(e, prefix))?;
        Ok(keys)
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64, KvError> {
        let mut conn = self.conn.clone();
        conn.incr(key, delta).await.map_err(|e| map_err(e, key))
    }

    async fn list_push(
        &self,
        key: &str,
        value: Value,
        ttl: Option<Duration>,
    ) -> Result<(), KvError> {
        let mut conn = self.conn.clone();
        let raw = serde_json::to_string(&value)?;
        conn.lpush::<_, _, ()>(key, raw)
            .await
            .map_err(|e| map_err(e, key))?;
        if let Some(ttl) = ttl {
            conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
                .await
                .map_err(|e| map_err(e, key))?;
        }
        Ok(())
    }

    async fn list_pop(&self, key: &str) -> Result<Option<Value>, KvError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn
            .lpop(key, None)
            .await
            .map_err(|e| map_err(e, key))?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    async fn list_delete(&self, key: &str) -> Result<bool, KvError> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(key).await.map_err(|e| map_err(e, key))?;
        Ok(removed > 0)
    }
}
