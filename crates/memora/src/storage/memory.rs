//! In-memory storage backend
//!
//! Process-local maps behind one async `RwLock`. Follows the same merge
//! and liveness rules as the SQLite backend; nothing survives a restart.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{MemoraError, Result};
use crate::memory::types::{Entity, Memory, Metadata};
use crate::storage::filter::MemoryFilter;
use crate::storage::{MemoryBackend, PutOutcome};

#[derive(Default)]
struct Inner {
    memories: HashMap<Uuid, Memory>,
    by_hash: HashMap<String, Uuid>,
    /// Entity key -> memories mentioning it
    by_entity: HashMap<String, BTreeSet<Uuid>>,
    /// Entity key -> canonical entity (first spelling wins)
    entities: HashMap<String, Entity>,
    schema_version: Option<String>,
}

impl Inner {
    fn link_entities(&mut self, id: Uuid, mentioned: &[Entity]) -> Result<()> {
        for entity in mentioned {
            let key = Entity::key(&entity.name);
            let canonical = self
                .entities
                .entry(key.clone())
                .or_insert_with(|| entity.clone())
                .clone();
            self.by_entity.entry(key).or_default().insert(id);
            self.memories
                .get_mut(&id)
                .ok_or_else(|| MemoraError::Database(format!("Memory {id} vanished mid-write")))?
                .add_entity(canonical);
        }
        Ok(())
    }

    fn remove(&mut self, id: Uuid) -> Option<Memory> {
        let memory = self.memories.remove(&id)?;
        self.by_hash.remove(&memory.content_hash);
        for entity in &memory.entities {
            let key = Entity::key(&entity.name);
            let orphaned = match self.by_entity.get_mut(&key) {
                Some(ids) => {
                    ids.remove(&id);
                    ids.is_empty()
                }
                None => false,
            };
            if orphaned {
                self.by_entity.remove(&key);
                self.entities.remove(&key);
            }
        }
        Some(memory)
    }
}

/// RFC 7396 merge: `null` removes a key, anything else overwrites it
fn merge_metadata(target: &mut Metadata, patch: &Metadata) {
    for (key, value) in patch {
        if value.is_null() {
            target.remove(key);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn sorted_entities(memory: &Memory) -> Memory {
    let mut memory = memory.clone();
    memory
        .entities
        .sort_by_key(|entity| Entity::key(&entity.name));
    memory
}

/// Ephemeral backend for tests and short-lived agents
#[derive(Default)]
pub struct InMemoryBackend {
    inner: RwLock<Inner>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, memory: &Memory) -> Result<PutOutcome> {
        let mut inner = self.inner.write().await;

        if let Some(&id) = inner.by_hash.get(&memory.content_hash) {
            let existing = inner
                .memories
                .get_mut(&id)
                .ok_or_else(|| {
                    MemoraError::Database(format!("Hash index points at missing {id}"))
                })?;

            existing.importance = memory.importance;
            existing.confidence = memory.confidence;
            existing.agent_id = memory.agent_id.clone();
            merge_metadata(&mut existing.metadata, &memory.metadata);

            let shift = memory.updated_at - existing.updated_at;
            if shift > chrono::Duration::zero() {
                existing.updated_at = memory.updated_at;
                existing.valid_to = existing
                    .valid_to
                    .and_then(|valid_to| valid_to.checked_add_signed(shift));
            }

            inner.link_entities(id, &memory.entities)?;
            return Ok(PutOutcome {
                id,
                inserted: false,
            });
        }

        let mut stored = memory.clone();
        stored.entities = Vec::new();
        let id = stored.id;
        inner.by_hash.insert(stored.content_hash.clone(), id);
        inner.memories.insert(id, stored);
        inner.link_entities(id, &memory.entities)?;

        Ok(PutOutcome { id, inserted: true })
    }

    async fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Memory>> {
        let inner = self.inner.read().await;
        Ok(inner
            .memories
            .get(&id)
            .filter(|m| !m.is_expired_at(now))
            .map(sorted_entities))
    }

    async fn get_by_entity(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let inner = self.inner.read().await;
        let Some(ids) = inner.by_entity.get(&Entity::key(name)) else {
            return Ok(Vec::new());
        };

        let mut memories: Vec<Memory> = ids
            .iter()
            .filter_map(|id| inner.memories.get(id))
            .filter(|m| !m.is_expired_at(now))
            .map(sorted_entities)
            .collect();
        memories.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(memories)
    }

    async fn search(
        &self,
        terms: &[String],
        filter: &MemoryFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>> {
        if terms.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let inner = self.inner.read().await;
        let mut hits: Vec<Memory> = inner
            .memories
            .values()
            .filter(|m| !m.is_expired_at(now) && filter.matches(m))
            .filter(|m| {
                let content = m.content.to_lowercase();
                terms.iter().any(|term| {
                    content.contains(term.as_str())
                        || m.entities.iter().any(|e| Entity::key(&e.name) == *term)
                })
            })
            .map(sorted_entities)
            .collect();

        hits.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then(b.updated_at.cmp(&a.updated_at))
                .then(a.id.cmp(&b.id))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut inner = self.inner.write().await;
        let expired: Vec<Uuid> = inner
            .memories
            .values()
            .filter(|m| m.is_expired_at(now))
            .map(|m| m.id)
            .collect();

        for id in &expired {
            inner.remove(*id);
        }
        Ok(expired.len())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.inner.write().await.remove(id).is_some())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.inner.read().await.memories.len())
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        Ok(self.inner.read().await.schema_version.clone())
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        self.inner.write().await.schema_version = Some(version.to_string());
        Ok(())
    }
}
