//! Deduplicating memory store
//!
//! [`MemoryStore`] validates records at the boundary, delegates storage to
//! the configured [`MemoryBackend`], and keeps the recall cache coherent
//! with writes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::memory::{Memory, RetentionPolicy};
use crate::migration::{MigrationContext, MigrationManager, MigrationReport};
use crate::recall::RecallCache;
use crate::storage::{MemoryBackend, MemoryFilter, PutOutcome, open_backend};

pub struct MemoryStore {
    backend: Arc<dyn MemoryBackend>,
    retention: RetentionPolicy,
    cache: Arc<RecallCache>,
    migration_report: MigrationReport,
}

impl MemoryStore {
    /// Open the configured backend and bring it up to date.
    ///
    /// A failing migration is logged and recorded in
    /// [`migration_report`](Self::migration_report); the store still opens
    /// on the version it had.
    pub async fn open(config: &Config) -> Result<Self> {
        Self::open_with_migrations(config, &MigrationManager::with_builtin()).await
    }

    /// Like [`open`](Self::open) with a custom migration registry
    pub async fn open_with_migrations(
        config: &Config,
        migrations: &MigrationManager,
    ) -> Result<Self> {
        config.validate()?;
        let retention = RetentionPolicy::from_config(&config.retention)?;
        let backend = open_backend(config)?;

        let ctx = MigrationContext::new(config, Arc::clone(&backend));
        let migration_report = migrations.run(&ctx).await;

        info!(
            "Memory store ready ({} backend, schema {})",
            backend.name(),
            migration_report.current_version
        );

        Ok(Self {
            backend,
            retention,
            cache: Arc::new(RecallCache::from_config(&config.cache)),
            migration_report,
        })
    }

    /// Wrap an already initialized backend. No migrations run.
    pub fn with_backend(
        backend: Arc<dyn MemoryBackend>,
        retention: RetentionPolicy,
        cache: Arc<RecallCache>,
    ) -> Self {
        Self {
            backend,
            retention,
            cache,
            migration_report: MigrationReport::default(),
        }
    }

    pub fn retention(&self) -> &RetentionPolicy {
        &self.retention
    }

    pub fn cache(&self) -> &Arc<RecallCache> {
        &self.cache
    }

    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration_report
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Upsert by content hash and return the stored id
    pub async fn put(&self, memory: Memory) -> Result<Uuid> {
        Ok(self.upsert(memory).await?.id)
    }

    /// Upsert by content hash, reporting whether a new row was created.
    ///
    /// Cached lookups for every mentioned entity are dropped before this
    /// returns.
    pub async fn upsert(&self, mut memory: Memory) -> Result<PutOutcome> {
        memory.validate()?;
        let outcome = self.backend.put(&memory).await?;

        for entity in &memory.entities {
            self.cache.invalidate_entity(&entity.name);
        }

        if outcome.inserted {
            debug!("Stored {} memory {}", memory.memory_type, outcome.id);
        } else {
            debug!("Merged duplicate into memory {}", outcome.id);
        }
        Ok(outcome)
    }

    pub async fn get_by_id(&self, id: Uuid) -> Result<Option<Memory>> {
        self.backend.get_by_id(id, Utc::now()).await
    }

    /// Live memories mentioning `name`, most recently created first
    pub async fn get_by_entity(&self, name: &str) -> Result<Vec<Memory>> {
        if name.trim().is_empty() {
            return Ok(Vec::new());
        }
        self.backend.get_by_entity(name, Utc::now()).await
    }

    /// Keyword lookup used by free-text recall
    pub async fn search(
        &self,
        terms: &[String],
        filter: &MemoryFilter,
        limit: usize,
    ) -> Result<Vec<Memory>> {
        self.backend.search(terms, filter, limit, Utc::now()).await
    }

    /// Remove memories past their `valid_to`
    pub async fn delete_expired(&self) -> Result<usize> {
        self.delete_expired_at(Utc::now()).await
    }

    /// Remove memories with `now > valid_to`
    pub async fn delete_expired_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let removed = self.backend.delete_expired(now).await?;
        if removed > 0 {
            self.cache.clear();
            info!("Expired {} memories", removed);
        }
        Ok(removed)
    }

    /// Remove one memory. Returns false if it did not exist.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let removed = self.backend.delete(id).await?;
        if removed {
            self.cache.clear();
            debug!("Deleted memory {}", id);
        }
        Ok(removed)
    }

    /// Stored rows, including expired ones not yet swept
    pub async fn count(&self) -> Result<usize> {
        self.backend.count().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Entity, MemoryType};
    use crate::recall::{CacheKey, RankedMemory};
    use crate::storage::InMemoryBackend;

    fn create_test_store() -> MemoryStore {
        MemoryStore::with_backend(
            Arc::new(InMemoryBackend::new()),
            RetentionPolicy::default(),
            Arc::new(RecallCache::default()),
        )
    }

    #[tokio::test]
    async fn test_put_rejects_blank_content() {
        let store = create_test_store();
        let result = store.put(Memory::new("   ", MemoryType::Context)).await;
        assert!(matches!(
            result,
            Err(crate::error::MemoraError::Validation(_))
        ));
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_put_invalidates_entity_cache() {
        let store = create_test_store();
        let key = CacheKey::entity("postgresql");
        store.cache().insert(
            key.clone(),
            vec![RankedMemory {
                memory: Memory::new("stale", MemoryType::Context),
                score: 0.1,
            }],
        );
        store.cache().insert(CacheKey::entity("redis"), Vec::new());

        let mut memory = Memory::new("We use PostgreSQL", MemoryType::Decision);
        memory.add_entity(Entity::new("PostgreSQL", "technology"));
        store.put(memory).await.unwrap();

        assert!(store.cache().get(&key).is_none());
        assert!(store.cache().get(&CacheKey::entity("redis")).is_some());
    }

    #[tokio::test]
    async fn test_blank_entity_lookup_is_empty() {
        let store = create_test_store();
        assert!(store.get_by_entity("  ").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_clears_cache_only_when_something_expired() {
        let store = create_test_store();
        store.cache().insert(CacheKey::query("q"), Vec::new());

        assert_eq!(store.delete_expired().await.unwrap(), 0);
        assert_eq!(store.cache().len(), 1);

        let mut memory = Memory::new("Build is red", MemoryType::Status);
        store.retention().apply(&mut memory);
        let valid_to = memory.valid_to.unwrap();
        store.put(memory).await.unwrap();

        let removed = store
            .delete_expired_at(valid_to + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.cache().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let store = create_test_store();
        let id = store
            .put(Memory::new("Temporary note", MemoryType::Context))
            .await
            .unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(store.get_by_id(id).await.unwrap().is_none());
        assert!(!store.delete(id).await.unwrap());
    }
}
