//! Storage backends for Memora
//!
//! A single [`MemoryBackend`] capability with two variants, chosen once from
//! configuration: SQLite (persistent, shared across processes) and an
//! in-memory map (tests and ephemeral agents).

pub mod filter;
pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::{BackendKind, Config};
use crate::error::Result;
use crate::memory::types::Memory;

pub use filter::MemoryFilter;
pub use memory::InMemoryBackend;
pub use sqlite::SqliteBackend;

/// Result of an upsert-by-hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOutcome {
    /// Id of the stored row (the existing id when deduplicated)
    pub id: Uuid,
    /// False when the content already existed and was merged
    pub inserted: bool,
}

/// Storage capability behind [`MemoryStore`](crate::store::MemoryStore).
///
/// Implementations must make `put` atomic with respect to concurrent
/// callers: identical content hashes converge to a single row.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Create tables and indices. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Insert `memory`, or merge it into the row with the same content hash.
    ///
    /// On merge the stored type, id and creation time are kept; importance,
    /// confidence and attribution take the new values; metadata is merged;
    /// `updated_at` moves forward and `valid_to` slides by the same amount.
    async fn put(&self, memory: &Memory) -> Result<PutOutcome>;

    /// Live memory with this id
    async fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Memory>>;

    /// Live memories mentioning `name` (case-insensitive), newest first
    async fn get_by_entity(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<Memory>>;

    /// Live memories whose content contains any of `terms` or that mention
    /// an entity named by one of them. `terms` must be lowercase.
    async fn search(
        &self,
        terms: &[String],
        filter: &MemoryFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Memory>>;

    /// Remove every memory with `now > valid_to`, then orphaned entities
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize>;

    /// Remove one memory. Returns false when it did not exist.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Number of stored rows, expired or not
    async fn count(&self) -> Result<usize>;

    /// Last applied migration version, if any
    async fn schema_version(&self) -> Result<Option<String>>;

    /// Persist the last applied migration version
    async fn set_schema_version(&self, version: &str) -> Result<()>;
}

/// Open the backend selected by `config.storage.backend`
pub fn open_backend(config: &Config) -> Result<Arc<dyn MemoryBackend>> {
    match config.storage.backend {
        BackendKind::Sqlite => {
            std::fs::create_dir_all(&config.storage.data_dir)?;
            let path = config.db_path();
            tracing::info!("Opening SQLite store at {}", path.display());
            Ok(Arc::new(SqliteBackend::new(
                path,
                std::time::Duration::from_millis(config.storage.busy_timeout_ms),
            )))
        }
        BackendKind::Memory => {
            tracing::info!("Opening in-memory store");
            Ok(Arc::new(InMemoryBackend::new()))
        }
    }
}
