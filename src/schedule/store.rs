//! Persistent schedule store.
//!
//! Replaces a static, file-defined schedule with a durable, independently
//! CRUD-able table of entries in the backing KV store, plus the in-memory
//! cache consulted by the beat loop.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::error::ScheduleError;
use crate::kv::KvStore;
use crate::schedule::entry::ScheduleEntry;

/// CRUD + periodic-consultation API over [`ScheduleEntry`] documents.
pub struct ScheduleStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    default_queue: String,
    /// In-memory working set of the beat loop. `None` until first load;
    /// set to an empty vec as the sentinel state after a failed load.
    cache: RwLock<Option<Vec<ScheduleEntry>>>,
}

impl ScheduleStore {
    pub fn new(kv: Arc<dyn KvStore>, config: &Config) -> Self {
        Self {
            kv,
            prefix: config.schedule_prefix.clone(),
            default_queue: config.default_queue.clone(),
            cache: RwLock::new(None),
        }
    }

    fn entry_key(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Upsert an entry by name.
    ///
    /// The entry's routing options are always overwritten with the
    /// process's own default routing target; stored entries cannot
    /// silently route to an arbitrary queue.
    pub async fn write(&self, mut entry: ScheduleEntry) -> Result<(), ScheduleError> {
        entry
            .schedule
            .validate()
            .map_err(|reason| ScheduleError::InvalidSchedule {
                name: entry.name.clone(),
                reason,
            })?;

        entry.options.insert(
            "queue".to_string(),
            serde_json::Value::String(self.default_queue.clone()),
        );

        let document = serde_json::to_value(&entry)
            .map_err(|e| ScheduleError::Backend(e.to_string()))?;
        self.kv
            .set(&self.entry_key(&entry.name), document, None)
            .await
            .map_err(|e| {
                tracing::error!(entry = %entry.name, error = %e, "Schedule write failed");
                ScheduleError::Backend(e.to_string())
            })?;
        tracing::info!(entry = %entry.name, task = %entry.task, "Schedule entry written");
        Ok(())
    }

    /// Delete an entry by name. Returns whether it existed.
    pub async fn delete(&self, name: &str) -> Result<bool, ScheduleError> {
        let existed = self.kv.delete(&self.entry_key(name)).await.map_err(|e| {
            tracing::error!(entry = %name, error = %e, "Schedule delete failed");
            ScheduleError::Backend(e.to_string())
        })?;
        tracing::info!(entry = %name, existed, "Schedule entry deleted");
        Ok(existed)
    }

    /// Read one fully materialized entry.
    pub async fn read(&self, name: &str) -> Result<Option<ScheduleEntry>, ScheduleError> {
        match self
            .kv
            .get(&self.entry_key(name))
            .await
            .map_err(|e| ScheduleError::Backend(e.to_string()))?
        {
            Some(value) => {
                let entry = serde_json::from_value(value).map_err(|e| {
                    ScheduleError::Parse {
                        name: name.to_string(),
                        reason: e.to_string(),
                    }
                })?;
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Read all fully materialized entries.
    pub async fn read_all(&self) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        self.load_all(true).await
    }

    /// Scan the backing store by key prefix and parse every stored
    /// document. A parse failure for an individual entry is logged and
    /// that entry skipped; only backend errors fail the whole load.
    pub async fn load_all(
        &self,
        include_last_run: bool,
    ) -> Result<Vec<ScheduleEntry>, ScheduleError> {
        let keys = self
            .kv
            .keys_with_prefix(&self.prefix)
            .await
            .map_err(|e| ScheduleError::Backend(e.to_string()))?;

        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            let value = match self.kv.get(&key).await {
                Ok(Some(value)) => value,
                Ok(None) => continue,
                Err(e) => return Err(ScheduleError::Backend(e.to_string())),
            };
            match serde_json::from_value::<ScheduleEntry>(value) {
                Ok(mut entry) => {
                    if !include_last_run {
                        entry.last_run_at = None;
                        entry.total_run_count = 0;
                    }
                    entries.push(entry);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Skipping unparseable schedule entry");
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    /// The beat loop's working set. Loads from the backing store on first
    /// consultation; a load failure yields the sentinel empty schedule
    /// rather than crashing the loop.
    pub async fn get_schedule(&self) -> Vec<ScheduleEntry> {
        {
            let cache = self.cache.read().await;
            if let Some(entries) = cache.as_ref() {
                return entries.clone();
            }
        }
        let loaded = match self.load_all(true).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "Schedule load failed; using empty schedule");
                Vec::new()
            }
        };
        *self.cache.write().await = Some(loaded.clone());
        loaded
    }

    /// Replace the in-memory working set.
    pub async fn set_schedule(&self, entries: Vec<ScheduleEntry>) {
        *self.cache.write().await = Some(entries);
    }

    /// Re-load the cache from the backing store, if a cache exists.
    pub async fn sync(&self) {
        let mut cache = self.cache.write().await;
        if cache.is_none() {
            return;
        }
        match self.load_all(true).await {
            Ok(entries) => *cache = Some(entries),
            Err(e) => {
                tracing::error!(error = %e, "Schedule sync failed; using empty schedule");
                *cache = Some(Vec::new());
            }
        }
    }

    /// Advance an entry's run bookkeeping for one firing and write it
    /// back so the state survives process restarts. Returns the advanced
    /// entry.
    pub async fn reserve(&self, name: &str) -> Result<ScheduleEntry, ScheduleError> {
        let mut entry = self
            .read(name)
            .await?
            .ok_or_else(|| ScheduleError::NotFound {
                name: name.to_string(),
            })?;
        entry.mark_run(Utc::now());

        let document = serde_json::to_value(&entry)
            .map_err(|e| ScheduleError::Backend(e.to_string()))?;
        self.kv
            .set(&self.entry_key(name), document, None)
            .await
            .map_err(|e| {
                tracing::error!(entry = %name, error = %e, "Schedule reserve write-back failed");
                ScheduleError::Backend(e.to_string())
            })?;

        // Keep the beat loop's working set in step with the write-back.
        let mut cache = self.cache.write().await;
        if let Some(entries) = cache.as_mut() {
            if let Some(cached) = entries.iter_mut().find(|e| e.name == entry.name) {
                *cached = entry.clone();
            }
        }
        tracing::debug!(
            entry = %entry.name,
            run_count = entry.total_run_count,
            "Schedule entry reserved"
        );
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKv;
    use crate::schedule::entry::Schedule;
    use serde_json::json;

    fn store() -> ScheduleStore {
        ScheduleStore::new(Arc::new(MemoryKv::new()), &Config::default())
    }

    fn cleanup_entry() -> ScheduleEntry {
        ScheduleEntry::new("cleanup", "tasks.cleanup", Schedule::minutes(1))
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();

        let entry = store.read("cleanup").await.unwrap().unwrap();
        assert_eq!(entry.task, "tasks.cleanup");
        assert_eq!(entry.schedule, Schedule::minutes(1));
    }

    #[tokio::test]
    async fn write_is_idempotent_by_name() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();
        store.write(cleanup_entry()).await.unwrap();
        assert_eq!(store.read_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn write_overwrites_routing_options() {
        let store = store();
        let mut entry = cleanup_entry();
        entry
            .options
            .insert("queue".to_string(), json!("sneaky-queue"));
        store.write(entry).await.unwrap();

        let stored = store.read("cleanup").await.unwrap().unwrap();
        assert_eq!(stored.options.get("queue"), Some(&json!("default")));
    }

    #[tokio::test]
    async fn write_rejects_invalid_schedule() {
        let store = store();
        let entry = ScheduleEntry::new("bad", "tasks.bad", Schedule::minutes(0));
        assert!(matches!(
            store.write(entry).await,
            Err(ScheduleError::InvalidSchedule { .. })
        ));
    }

    #[tokio::test]
    async fn delete_then_read_is_absent() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();
        assert!(store.delete("cleanup").await.unwrap());
        assert!(store.read("cleanup").await.unwrap().is_none());
        assert!(!store.delete("cleanup").await.unwrap());
    }

    #[tokio::test]
    async fn load_all_skips_unparseable_entries() {
        let kv = Arc::new(MemoryKv::new());
        let config = Config::default();
        let store = ScheduleStore::new(kv.clone(), &config);
        store.write(cleanup_entry()).await.unwrap();

        // A corrupt document under the schedule prefix must not poison
        // the whole load.
        use crate::kv::KvStore as _;
        kv.set(
            &format!("{}corrupt", config.schedule_prefix),
            json!({"not": "an entry"}),
            None,
        )
        .await
        .unwrap();

        let entries = store.load_all(true).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "cleanup");
    }

    #[tokio::test]
    async fn load_all_can_strip_run_metadata() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();
        store.reserve("cleanup").await.unwrap();

        let with_runs = store.load_all(true).await.unwrap();
        assert_eq!(with_runs[0].total_run_count, 1);

        let without_runs = store.load_all(false).await.unwrap();
        assert_eq!(without_runs[0].total_run_count, 0);
        assert!(without_runs[0].last_run_at.is_none());
    }

    #[tokio::test]
    async fn reserve_advances_and_persists() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();

        let first = store.reserve("cleanup").await.unwrap();
        assert_eq!(first.total_run_count, 1);
        let first_run = first.last_run_at.unwrap();

        let second = store.reserve("cleanup").await.unwrap();
        assert_eq!(second.total_run_count, 2);
        assert!(second.last_run_at.unwrap() >= first_run);

        // survives a fresh read from the backing store
        let persisted = store.read("cleanup").await.unwrap().unwrap();
        assert_eq!(persisted.total_run_count, 2);
    }

    #[tokio::test]
    async fn reserve_unknown_entry_errors() {
        let store = store();
        assert!(matches!(
            store.reserve("ghost").await,
            Err(ScheduleError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn get_schedule_caches_and_sync_reloads() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();

        let first = store.get_schedule().await;
        assert_eq!(first.len(), 1);

        // A write after the cache is built is invisible until sync()
        store
            .write(ScheduleEntry::new(
                "second",
                "tasks.second",
                Schedule::seconds(30),
            ))
            .await
            .unwrap();
        assert_eq!(store.get_schedule().await.len(), 1);

        store.sync().await;
        assert_eq!(store.get_schedule().await.len(), 2);
    }

    #[tokio::test]
    async fn sync_without_cache_is_a_no_op() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();
        store.sync().await;
        // cache still unbuilt; first get_schedule loads fresh
        assert_eq!(store.get_schedule().await.len(), 1);
    }

    #[tokio::test]
    async fn reserve_updates_cached_entry() {
        let store = store();
        store.write(cleanup_entry()).await.unwrap();
        let _ = store.get_schedule().await;

        store.reserve("cleanup").await.unwrap();
        let cached = store.get_schedule().await;
        assert_eq!(cached[0].total_run_count, 1);
    }
}
