//! Integration tests for the storage layer
//!
//! Every contract test runs against both backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde_json::json;
use tempfile::{TempDir, tempdir};

use memora::memory::{Entity, Memory, MemoryType, Metadata};
use memora::storage::{InMemoryBackend, MemoryBackend, MemoryFilter, SqliteBackend};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Test fixture: an initialized backend of each kind
async fn create_test_backends() -> (Vec<Arc<dyn MemoryBackend>>, TempDir) {
    let dir = tempdir().unwrap();
    let sqlite = SqliteBackend::new(dir.path().join("memora.db"), BUSY_TIMEOUT);
    sqlite.initialize().await.unwrap();
    let backends: Vec<Arc<dyn MemoryBackend>> =
        vec![Arc::new(sqlite), Arc::new(InMemoryBackend::new())];
    (backends, dir)
}

/// SQLite keeps microseconds; truncate so round-tripped timestamps compare equal
fn now_micros() -> DateTime<Utc> {
    DateTime::from_timestamp_micros(Utc::now().timestamp_micros()).unwrap()
}

fn create_test_memory(content: &str, memory_type: MemoryType) -> Memory {
    let mut memory = Memory::new(content, memory_type);
    memory.created_at = now_micros();
    memory.updated_at = memory.created_at;
    memory
}

fn metadata(pairs: &[(&str, serde_json::Value)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

mod dedup_tests {
    use super::*;

    #[tokio::test]
    async fn test_repeated_put_keeps_one_row_with_latest_scores() {
        let (backends, _dir) = create_test_backends().await;
        let now = now_micros();

        for backend in backends {
            let mut first = create_test_memory("We use PostgreSQL", MemoryType::Decision);
            first.importance = 0.5;
            first.confidence = 0.6;
            let original = backend.put(&first).await.unwrap();
            assert!(original.inserted, "{}", backend.name());

            let mut second = create_test_memory("  We use PostgreSQL ", MemoryType::Decision);
            second.importance = 0.9;
            second.confidence = 0.95;
            let merged = backend.put(&second).await.unwrap();

            assert!(!merged.inserted, "{}", backend.name());
            assert_eq!(merged.id, original.id, "{}", backend.name());
            assert_eq!(backend.count().await.unwrap(), 1, "{}", backend.name());

            let stored = backend.get_by_id(original.id, now).await.unwrap().unwrap();
            assert_eq!(stored.importance, 0.9, "{}", backend.name());
            assert_eq!(stored.confidence, 0.95, "{}", backend.name());
            assert_eq!(stored.created_at, first.created_at, "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_merge_patches_metadata() {
        let (backends, _dir) = create_test_backends().await;
        let now = now_micros();

        for backend in backends {
            let mut first = create_test_memory("Standup is at 9", MemoryType::Context);
            first.metadata = metadata(&[("source", json!("chat")), ("room", json!("ops"))]);
            let outcome = backend.put(&first).await.unwrap();

            let mut second = create_test_memory("Standup is at 9", MemoryType::Context);
            second.metadata = metadata(&[("source", json!("cli")), ("room", json!(null))]);
            backend.put(&second).await.unwrap();

            let stored = backend.get_by_id(outcome.id, now).await.unwrap().unwrap();
            assert_eq!(stored.metadata.get("source"), Some(&json!("cli")), "{}", backend.name());
            assert!(!stored.metadata.contains_key("room"), "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_reinforcement_slides_expiry() {
        let (backends, _dir) = create_test_backends().await;

        for backend in backends {
            let created = now_micros() - ChronoDuration::hours(2);
            let mut first = create_test_memory("Build is red", MemoryType::Status);
            first.created_at = created;
            first.updated_at = created;
            first.valid_to = Some(created + ChronoDuration::hours(6));
            let outcome = backend.put(&first).await.unwrap();

            let mut second = create_test_memory("Build is red", MemoryType::Status);
            second.created_at = created + ChronoDuration::hours(2);
            second.updated_at = second.created_at;
            second.valid_to = Some(second.created_at + ChronoDuration::hours(6));
            backend.put(&second).await.unwrap();

            let stored = backend
                .get_by_id(outcome.id, now_micros())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(stored.created_at, created, "{}", backend.name());
            assert_eq!(stored.updated_at, second.updated_at, "{}", backend.name());
            assert_eq!(stored.valid_to, second.valid_to, "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_concurrent_identical_puts_converge() {
        let (backends, _dir) = create_test_backends().await;

        for backend in backends {
            let puts = (0..16).map(|_| {
                let backend = Arc::clone(&backend);
                tokio::spawn(async move {
                    let memory = create_test_memory("Deploys happen on Tuesdays", MemoryType::Pattern);
                    backend.put(&memory).await.unwrap()
                })
            });
            let outcomes: Vec<_> = join_all(puts)
                .await
                .into_iter()
                .map(|r| r.unwrap())
                .collect();

            assert_eq!(backend.count().await.unwrap(), 1, "{}", backend.name());
            assert_eq!(outcomes.iter().filter(|o| o.inserted).count(), 1, "{}", backend.name());
            assert!(outcomes.iter().all(|o| o.id == outcomes[0].id), "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_separate_connections_converge() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.db");
        SqliteBackend::new(&path, BUSY_TIMEOUT)
            .initialize()
            .await
            .unwrap();

        let puts = (0..8).map(|_| {
            let path = path.clone();
            tokio::spawn(async move {
                let backend = SqliteBackend::new(path, BUSY_TIMEOUT);
                let memory = create_test_memory("Prod runs on Kubernetes", MemoryType::Decision);
                backend.put(&memory).await.unwrap()
            })
        });
        let outcomes: Vec<_> = join_all(puts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        let reader = SqliteBackend::new(&path, BUSY_TIMEOUT);
        assert_eq!(reader.count().await.unwrap(), 1);
        assert!(outcomes.iter().all(|o| o.id == outcomes[0].id));
    }
}

mod lookup_tests {
    use super::*;

    #[tokio::test]
    async fn test_get_by_entity_newest_first_case_insensitive() {
        let (backends, _dir) = create_test_backends().await;
        let base = now_micros() - ChronoDuration::minutes(10);

        for backend in backends {
            for (i, content) in ["Redis holds sessions", "Redis is on port 6380"].iter().enumerate() {
                let mut memory = create_test_memory(content, MemoryType::Decision);
                memory.created_at = base + ChronoDuration::minutes(i as i64);
                memory.updated_at = memory.created_at;
                memory.add_entity(Entity::new("Redis", "technology"));
                backend.put(&memory).await.unwrap();
            }
            let unrelated = create_test_memory("Lunch is at noon", MemoryType::Context);
            backend.put(&unrelated).await.unwrap();

            let found = backend.get_by_entity("REDIS", now_micros()).await.unwrap();
            let contents: Vec<&str> = found.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(
                contents,
                vec!["Redis is on port 6380", "Redis holds sessions"],
                "{}",
                backend.name()
            );
            assert_eq!(found[0].entities[0].name, "Redis", "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_expired_memories_are_hidden() {
        let (backends, _dir) = create_test_backends().await;
        let now = now_micros();

        for backend in backends {
            let mut memory = create_test_memory("Incident bridge is open", MemoryType::Status);
            memory.created_at = now - ChronoDuration::hours(7);
            memory.updated_at = memory.created_at;
            memory.valid_to = Some(now - ChronoDuration::hours(1));
            memory.add_entity(Entity::new("Incident", "concept"));
            let outcome = backend.put(&memory).await.unwrap();

            assert!(backend.get_by_id(outcome.id, now).await.unwrap().is_none(), "{}", backend.name());
            assert!(backend.get_by_entity("incident", now).await.unwrap().is_empty(), "{}", backend.name());
            // Hidden but still stored until swept
            assert_eq!(backend.count().await.unwrap(), 1, "{}", backend.name());
        }
    }

    #[tokio::test]
    async fn test_search_matches_content_and_entities() {
        let (backends, _dir) = create_test_backends().await;
        let now = now_micros();

        for backend in backends {
            let mut by_entity = create_test_memory("Primary store for orders", MemoryType::Decision);
            by_entity.importance = 0.8;
            by_entity.add_entity(Entity::new("PostgreSQL", "technology"));
            backend.put(&by_entity).await.unwrap();

            let mut by_content = create_test_memory("postgresql backups run nightly", MemoryType::Pattern);
            by_content.importance = 0.6;
            backend.put(&by_content).await.unwrap();

            backend
                .put(&create_test_memory("Lunch is at noon", MemoryType::Context))
                .await
                .unwrap();

            let found = backend
                .search(&["postgresql".to_string()], &MemoryFilter::default(), 10, now)
                .await
                .unwrap();
            let contents: Vec<&str> = found.iter().map(|m| m.content.as_str()).collect();
            assert_eq!(
                contents,
                vec!["Primary store for orders", "postgresql backups run nightly"],
                "{}",
                backend.name()
            );

            let filtered = backend
                .search(
                    &["postgresql".to_string()],
                    &MemoryFilter::new().with_memory_types(vec![MemoryType::Pattern]),
                    10,
                    now,
                )
                .await
                .unwrap();
            assert_eq!(filtered.len(), 1, "{}", backend.name());
        }
    }
}

mod deletion_tests {
    use super::*;

    #[tokio::test]
    async fn test_delete_expired_removes_only_expired() {
        let (backends, _dir) = create_test_backends().await;
        let now = now_micros();

        for backend in backends {
            let mut expired = create_test_memory("Old status", MemoryType::Status);
            expired.created_at = now - ChronoDuration::hours(7);
            expired.updated_at = expired.created_at;
            expired.valid_to = Some(now - ChronoDuration::hours(1));
            expired.add_entity(Entity::new("Staging", "concept"));
            backend.put(&expired).await.unwrap();

            let mut boundary = create_test_memory("Expires right now", MemoryType::Status);
            boundary.created_at = now - ChronoDuration::hours(6);
            boundary.updated_at = boundary.created_at;
            boundary.valid_to = Some(now);
            backend.put(&boundary).await.unwrap();

            backend
                .put(&create_test_memory("My name is Sam", MemoryType::Identity))
                .await
                .unwrap();

            assert_eq!(backend.delete_expired(now).await.unwrap(), 1, "{}", backend.name());
            assert_eq!(backend.count().await.unwrap(), 2, "{}", backend.name());
            assert!(backend.get_by_entity("staging", now).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_delete_by_id() {
        let (backends, _dir) = create_test_backends().await;

        for backend in backends {
            let outcome = backend
                .put(&create_test_memory("Temporary note", MemoryType::Context))
                .await
                .unwrap();

            assert!(backend.delete(outcome.id).await.unwrap(), "{}", backend.name());
            assert!(!backend.delete(outcome.id).await.unwrap(), "{}", backend.name());
            assert_eq!(backend.count().await.unwrap(), 0, "{}", backend.name());
        }
    }
}

mod persistence_tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("memora.db");

        let id = {
            let backend = SqliteBackend::new(&path, BUSY_TIMEOUT);
            backend.initialize().await.unwrap();
            let mut memory = create_test_memory("We ship on Thursdays", MemoryType::Pattern);
            memory.add_entity(Entity::new("Release", "concept"));
            backend.put(&memory).await.unwrap().id
        };

        let reopened = SqliteBackend::new(&path, BUSY_TIMEOUT);
        reopened.initialize().await.unwrap();
        let stored = reopened.get_by_id(id, now_micros()).await.unwrap().unwrap();
        assert_eq!(stored.content, "We ship on Thursdays");
        assert_eq!(stored.entities, vec![Entity::new("Release", "concept")]);
    }
}
