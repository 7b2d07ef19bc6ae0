//! Integration tests for recall: ranking, caching and latency behavior

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tempfile::{TempDir, tempdir};
use tokio::sync::Notify;
use uuid::Uuid;

use memora::config::{BackendKind, RecallConfig};
use memora::error::Result;
use memora::memory::{Entity, Memory, MemoryType, RetentionPolicy};
use memora::recall::{RecallCache, Recaller};
use memora::storage::{InMemoryBackend, MemoryBackend, MemoryFilter, PutOutcome};
use memora::store::MemoryStore;
use memora::testing::test_config;
use memora::{LearnRequest, Memora};

const TIMEOUT: Duration = Duration::from_millis(500);

/// Test fixture: SQLite-backed store with a recaller on top
async fn create_test_store() -> (Arc<MemoryStore>, Recaller, TempDir) {
    let dir = tempdir().unwrap();
    let config = test_config(dir.path(), BackendKind::Sqlite);
    let store = Arc::new(MemoryStore::open(&config).await.unwrap());
    let recaller = Recaller::new(Arc::clone(&store), config.recall.clone());
    (store, recaller, dir)
}

fn create_test_memory(content: &str, importance: f32, entity: &str) -> Memory {
    let mut memory = Memory::new(content, MemoryType::Decision);
    memory.importance = importance;
    memory.add_entity(Entity::new(entity, "technology"));
    memory
}

/// Backend whose reads take longer than any recall timeout used here
#[derive(Default)]
struct StalledBackend {
    inner: InMemoryBackend,
}

const STALL: Duration = Duration::from_secs(2);

#[async_trait]
impl MemoryBackend for StalledBackend {
    fn name(&self) -> &'static str {
        "stalled"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, memory: &Memory) -> Result<PutOutcome> {
        self.inner.put(memory).await
    }

    async fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Memory>> {
        self.inner.get_by_id(id, now).await
    }

    async fn get_by_entity(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        tokio::time::sleep(STALL).await;
        self.inner.get_by_entity(name, now).await
    }

    async fn search(
        &self,
        terms: &[String],
        filter: &MemoryFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        tokio::time::sleep(STALL).await;
        self.inner.search(terms, filter, limit, now).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_expired(now).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        self.inner.schema_version().await
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        self.inner.set_schema_version(version).await
    }
}

/// Backend that holds the first armed entity read after its snapshot is
/// taken, until the test releases it
#[derive(Default)]
struct GatedBackend {
    inner: InMemoryBackend,
    armed: AtomicBool,
    snapshot_taken: Notify,
    release: Notify,
}

#[async_trait]
impl MemoryBackend for GatedBackend {
    fn name(&self) -> &'static str {
        "gated"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, memory: &Memory) -> Result<PutOutcome> {
        self.inner.put(memory).await
    }

    async fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Memory>> {
        self.inner.get_by_id(id, now).await
    }

    async fn get_by_entity(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let snapshot = self.inner.get_by_entity(name, now).await;
        if self.armed.swap(false, Ordering::SeqCst) {
            self.snapshot_taken.notify_one();
            self.release.notified().await;
        }
        snapshot
    }

    async fn search(
        &self,
        terms: &[String],
        filter: &MemoryFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        self.inner.search(terms, filter, limit, now).await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        self.inner.delete_expired(now).await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.inner.delete(id).await
    }

    async fn count(&self) -> Result<usize> {
        self.inner.count().await
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        self.inner.schema_version().await
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        self.inner.set_schema_version(version).await
    }
}

mod ranking_tests {
    use super::*;

    #[tokio::test]
    async fn test_entity_recall_orders_by_importance() {
        let (store, recaller, _dir) = create_test_store().await;
        for (content, importance) in [
            ("Kafka topic naming uses dots", 0.2),
            ("Kafka is the event bus", 0.9),
            ("Kafka retention is seven days", 0.5),
        ] {
            store
                .put(create_test_memory(content, importance, "Kafka"))
                .await
                .unwrap();
        }

        let result = recaller.recall_entity("kafka", 3, TIMEOUT).await;
        let importances: Vec<f32> = result
            .memories
            .iter()
            .map(|r| r.memory.importance)
            .collect();
        assert_eq!(importances, vec![0.9, 0.5, 0.2]);
    }

    #[tokio::test]
    async fn test_equal_scores_prefer_newest() {
        let (store, recaller, _dir) = create_test_store().await;
        let now = Utc::now();

        let mut older = create_test_memory("Nginx terminates TLS", 0.6, "nginx");
        older.created_at = now - ChronoDuration::hours(1);
        older.updated_at = now;
        let mut newer = create_test_memory("Nginx serves static files", 0.6, "nginx");
        newer.created_at = now;
        newer.updated_at = now;
        store.put(older).await.unwrap();
        store.put(newer).await.unwrap();

        let result = recaller.recall_entity("nginx", 2, TIMEOUT).await;
        assert_eq!(result.len(), 2);
        assert_eq!(result.memories[0].score, result.memories[1].score);
        assert_eq!(result.memories[0].memory.content, "Nginx serves static files");
    }

    #[tokio::test]
    async fn test_expired_memories_never_recalled() {
        let (store, recaller, _dir) = create_test_store().await;
        let now = Utc::now();

        let mut stale = create_test_memory("Terraform apply is running", 0.4, "Terraform");
        stale.created_at = now - ChronoDuration::hours(8);
        stale.updated_at = stale.created_at;
        stale.valid_to = Some(now - ChronoDuration::hours(2));
        store.put(stale).await.unwrap();

        let result = recaller.recall("terraform", 5, TIMEOUT).await;
        assert!(result.is_empty());
        assert!(!result.degraded);
    }
}

mod cache_tests {
    use super::*;

    #[tokio::test]
    async fn test_write_invalidates_entity_lookup() {
        let (store, recaller, _dir) = create_test_store().await;
        store
            .put(create_test_memory("Redis caches sessions", 0.7, "Redis"))
            .await
            .unwrap();

        let first = recaller.recall_entity("Redis", 5, TIMEOUT).await;
        assert_eq!(first.len(), 1);
        assert!(recaller.recall_entity("redis", 5, TIMEOUT).await.cache_hit);

        store
            .put(create_test_memory("Redis runs in cluster mode", 0.7, "redis"))
            .await
            .unwrap();

        let after = recaller.recall_entity("Redis", 5, TIMEOUT).await;
        assert!(!after.cache_hit);
        assert_eq!(after.len(), 2);
    }

    #[tokio::test]
    async fn test_sweep_clears_cached_results() {
        let (store, recaller, _dir) = create_test_store().await;
        let now = Utc::now();

        let mut status = create_test_memory("Docker registry is down", 0.4, "Docker");
        status.created_at = now - ChronoDuration::hours(1);
        status.updated_at = status.created_at;
        status.valid_to = Some(now + ChronoDuration::minutes(1));
        store.put(status).await.unwrap();

        assert_eq!(recaller.recall_entity("docker", 5, TIMEOUT).await.len(), 1);
        assert_eq!(
            store
                .delete_expired_at(now + ChronoDuration::minutes(2))
                .await
                .unwrap(),
            1
        );
        let after = recaller.recall_entity("docker", 5, TIMEOUT).await;
        assert!(!after.cache_hit);
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_write_during_recall_is_not_masked_by_stale_result() {
        let backend = Arc::new(GatedBackend::default());
        let store = Arc::new(MemoryStore::with_backend(
            Arc::clone(&backend) as Arc<dyn MemoryBackend>,
            RetentionPolicy::default(),
            Arc::new(RecallCache::default()),
        ));
        let recaller = Recaller::new(Arc::clone(&store), RecallConfig::default());
        store
            .put(create_test_memory("We use PostgreSQL 14", 0.7, "PostgreSQL"))
            .await
            .unwrap();

        backend.armed.store(true, Ordering::SeqCst);
        let (in_flight, _) = tokio::join!(
            recaller.recall_entity("PostgreSQL", 5, TIMEOUT),
            async {
                backend.snapshot_taken.notified().await;
                store
                    .put(create_test_memory("We upgraded PostgreSQL to 16", 0.7, "PostgreSQL"))
                    .await
                    .unwrap();
                backend.release.notify_one();
            }
        );
        // The read began before the write, so it may miss it
        assert_eq!(in_flight.len(), 1);

        let after = recaller.recall_entity("PostgreSQL", 5, TIMEOUT).await;
        assert!(!after.cache_hit);
        assert!(
            after
                .memories
                .iter()
                .any(|r| r.memory.content == "We upgraded PostgreSQL to 16")
        );
        assert_eq!(after.len(), 2);
    }
}

mod latency_tests {
    use super::*;

    fn stalled_recaller() -> Recaller {
        let store = Arc::new(MemoryStore::with_backend(
            Arc::new(StalledBackend::default()),
            RetentionPolicy::default(),
            Arc::new(RecallCache::default()),
        ));
        Recaller::new(store, RecallConfig::default())
    }

    #[tokio::test]
    async fn test_timeout_degrades_to_empty() {
        let recaller = stalled_recaller();
        let result = recaller
            .recall("anything about deploys", 5, Duration::from_millis(50))
            .await;

        assert!(result.degraded);
        assert!(result.is_empty());
        assert!(result.elapsed < STALL);
    }

    #[tokio::test]
    async fn test_degraded_results_are_not_cached() {
        let recaller = stalled_recaller();
        recaller
            .recall_entity("Kafka", 5, Duration::from_millis(20))
            .await;
        let again = recaller
            .recall_entity("Kafka", 5, Duration::from_millis(20))
            .await;
        assert!(!again.cache_hit);
        assert!(again.degraded);
    }
}

mod end_to_end_tests {
    use super::*;

    #[tokio::test]
    async fn test_learn_then_recall_within_budget() {
        let dir = tempdir().unwrap();
        let memora = Memora::open(test_config(dir.path(), BackendKind::Sqlite))
            .await
            .unwrap();

        let ack = memora
            .learn(
                LearnRequest::new("We use PostgreSQL as the database", "chat")
                    .with_memory_type(MemoryType::Decision)
                    .synchronous(),
            )
            .await;
        assert!(ack.accepted);
        memora
            .learn(LearnRequest::new("Lunch is at noon on Fridays", "chat").synchronous())
            .await;

        let budget = memora.config().recall.latency_budget();
        let result = memora
            .recall("what database do we use?", 3, TIMEOUT)
            .await;

        assert!(!result.degraded);
        assert!(result.elapsed <= budget, "took {:?}", result.elapsed);
        assert!(
            result
                .memories
                .iter()
                .take(3)
                .any(|r| r.memory.content == "We use PostgreSQL as the database")
        );
    }

    #[tokio::test]
    async fn test_async_learn_is_recalled_after_drain() {
        let dir = tempdir().unwrap();
        let memora = Memora::open(test_config(dir.path(), BackendKind::Sqlite))
            .await
            .unwrap();

        memora
            .learn(LearnRequest::new("We deploy with Kubernetes", "chat"))
            .await;
        assert!(memora.recall_entity("kubernetes", 3, TIMEOUT).await.is_empty());

        memora.processor().drain_once().await.unwrap();

        let result = memora.recall_entity("kubernetes", 3, TIMEOUT).await;
        assert_eq!(result.len(), 1);
        assert!(!result.cache_hit);
    }
}
