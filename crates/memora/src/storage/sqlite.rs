//! SQLite storage backend
//!
//! Every operation opens its own connection on a blocking thread, so
//! several backends (and several processes) can share one database file.
//! Deduplication is enforced by the UNIQUE constraint on `content_hash`
//! and an `ON CONFLICT DO UPDATE` upsert, never by in-process locking.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior, params};
use uuid::Uuid;

use crate::error::{MemoraError, Result};
use crate::memory::types::{Entity, Memory, MemoryType, Metadata};
use crate::storage::filter::MemoryFilter;
use crate::storage::{MemoryBackend, PutOutcome};

const SCHEMA_VERSION_KEY: &str = "schema_version";
const MAX_BUSY_RETRIES: u32 = 5;
/// Memory ids per entity lookup, well under SQLite's bound-parameter limit
const ENTITY_BATCH: usize = 500;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS memories (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    content_hash TEXT NOT NULL UNIQUE,
    memory_type TEXT NOT NULL,
    importance REAL NOT NULL,
    confidence REAL NOT NULL,
    agent_id TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    valid_to INTEGER
);
CREATE INDEX IF NOT EXISTS idx_memories_type_valid_to ON memories(memory_type, valid_to);

CREATE TABLE IF NOT EXISTS entities (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE COLLATE NOCASE,
    entity_type TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS mentions (
    memory_id TEXT NOT NULL REFERENCES memories(id) ON DELETE CASCADE,
    entity_id INTEGER NOT NULL REFERENCES entities(id) ON DELETE CASCADE,
    PRIMARY KEY (memory_id, entity_id)
);
CREATE INDEX IF NOT EXISTS idx_mentions_entity ON mentions(entity_id);

CREATE TABLE IF NOT EXISTS system (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const MEMORY_COLUMNS: &str = "m.id, m.content, m.content_hash, m.memory_type, m.importance, \
     m.confidence, m.agent_id, m.metadata, m.created_at, m.updated_at, m.valid_to";

// Re-ingestion keeps id, type and created_at. valid_to slides forward by
// however far updated_at moved, so the retention class never changes.
const UPSERT_MEMORY: &str = r#"
INSERT INTO memories (
    id, content, content_hash, memory_type, importance, confidence,
    agent_id, metadata, created_at, updated_at, valid_to
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
ON CONFLICT(content_hash) DO UPDATE SET
    importance = excluded.importance,
    confidence = excluded.confidence,
    agent_id = excluded.agent_id,
    metadata = json_patch(memories.metadata, excluded.metadata),
    updated_at = MAX(memories.updated_at, excluded.updated_at),
    valid_to = CASE
        WHEN memories.valid_to IS NULL THEN NULL
        ELSE memories.valid_to + MAX(0, excluded.updated_at - memories.updated_at)
    END
RETURNING id
"#;

/// Persistent backend over a single SQLite file
pub struct SqliteBackend {
    path: PathBuf,
    busy_timeout: Duration,
}

impl SqliteBackend {
    pub fn new(path: impl Into<PathBuf>, busy_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            busy_timeout,
        }
    }

    /// Database file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path, busy_timeout: Duration) -> Result<Connection> {
        let conn = Connection::open(path).map_err(|e| {
            MemoraError::Database(format!("Failed to open {}: {e}", path.display()))
        })?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    /// Run `op` against a fresh connection on the blocking pool
    async fn run<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let path = self.path.clone();
        let busy_timeout = self.busy_timeout;
        tokio::task::spawn_blocking(move || {
            let mut conn = Self::connect(&path, busy_timeout)?;
            op(&mut conn)
        })
        .await
        .map_err(|e| MemoraError::Database(format!("SQLite task failed: {e}")))?
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

/// Retry `op` while SQLite reports the database busy. The busy timeout
/// covers most contention; this catches lock upgrades it cannot wait out.
fn with_busy_retry<T>(mut op: impl FnMut() -> rusqlite::Result<T>) -> rusqlite::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(err) if is_busy(&err) && attempt < MAX_BUSY_RETRIES => {
                attempt += 1;
                tracing::debug!("SQLite busy, retrying ({}/{})", attempt, MAX_BUSY_RETRIES);
                std::thread::sleep(Duration::from_millis(10 * u64::from(attempt)));
            }
            result => return result,
        }
    }
}

fn escape_like(term: &str) -> String {
    term.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| MemoraError::Database(format!("Invalid timestamp: {micros}")))
}

/// Raw column values of one `memories` row
struct MemoryRow {
    id: String,
    content: String,
    content_hash: String,
    memory_type: String,
    importance: f64,
    confidence: f64,
    agent_id: String,
    metadata: String,
    created_at: i64,
    updated_at: i64,
    valid_to: Option<i64>,
}

impl MemoryRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            content: row.get(1)?,
            content_hash: row.get(2)?,
            memory_type: row.get(3)?,
            importance: row.get(4)?,
            confidence: row.get(5)?,
            agent_id: row.get(6)?,
            metadata: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            valid_to: row.get(10)?,
        })
    }

    fn into_memory(self, entities: Vec<Entity>) -> Result<Memory> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| MemoraError::Database(format!("Invalid memory id {}: {e}", self.id)))?;
        let memory_type: MemoryType = self.memory_type.parse().map_err(|_| {
            MemoraError::Database(format!("Unknown memory type in row: {}", self.memory_type))
        })?;
        let metadata: Metadata = serde_json::from_str(&self.metadata)?;

        Ok(Memory {
            id,
            content: self.content,
            content_hash: self.content_hash,
            memory_type,
            importance: self.importance as f32,
            confidence: self.confidence as f32,
            agent_id: self.agent_id,
            metadata,
            entities,
            created_at: from_micros(self.created_at)?,
            updated_at: from_micros(self.updated_at)?,
            valid_to: self.valid_to.map(from_micros).transpose()?,
        })
    }
}

/// Entities of every memory in `memory_ids`, keyed by memory id
fn load_entities(
    conn: &Connection,
    memory_ids: &[&str],
) -> rusqlite::Result<HashMap<String, Vec<Entity>>> {
    let mut by_memory: HashMap<String, Vec<Entity>> = HashMap::new();

    for chunk in memory_ids.chunks(ENTITY_BATCH) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "SELECT mn.memory_id, e.name, e.entity_type
               FROM entities e
               JOIN mentions mn ON mn.entity_id = e.id
              WHERE mn.memory_id IN ({placeholders})
              ORDER BY mn.memory_id, e.name"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(chunk), |r| {
            Ok((
                r.get::<_, String>(0)?,
                Entity::new(r.get::<_, String>(1)?, r.get::<_, String>(2)?),
            ))
        })?;
        for row in rows {
            let (memory_id, entity) = row?;
            by_memory.entry(memory_id).or_default().push(entity);
        }
    }

    Ok(by_memory)
}

fn query_memories(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Memory>> {
    let rows: Vec<MemoryRow> = {
        let mut stmt = conn.prepare(sql)?;
        let mapped = stmt.query_map(params, MemoryRow::from_row)?;
        mapped.collect::<rusqlite::Result<_>>()?
    };

    let ids: Vec<&str> = rows.iter().map(|row| row.id.as_str()).collect();
    let mut entities = load_entities(conn, &ids)?;

    rows.into_iter()
        .map(|row| {
            let mentioned = entities.remove(&row.id).unwrap_or_default();
            row.into_memory(mentioned)
        })
        .collect()
}

fn put_memory(conn: &mut Connection, memory: &Memory) -> rusqlite::Result<(String, bool)> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let existed = tx
        .query_row(
            "SELECT 1 FROM memories WHERE content_hash = ?1",
            [&memory.content_hash],
            |_| Ok(()),
        )
        .optional()?
        .is_some();

    let metadata = serde_json::to_string(&memory.metadata)
        .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

    let id: String = tx.query_row(
        UPSERT_MEMORY,
        params![
            memory.id.to_string(),
            memory.content,
            memory.content_hash,
            memory.memory_type.as_str(),
            f64::from(memory.importance),
            f64::from(memory.confidence),
            memory.agent_id,
            metadata,
            memory.created_at.timestamp_micros(),
            memory.updated_at.timestamp_micros(),
            memory.valid_to.map(|t| t.timestamp_micros()),
        ],
        |r| r.get(0),
    )?;

    for entity in &memory.entities {
        tx.execute(
            "INSERT INTO entities (name, entity_type) VALUES (?1, ?2)
             ON CONFLICT(name) DO NOTHING",
            params![entity.name, entity.entity_type],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO mentions (memory_id, entity_id)
             SELECT ?1, id FROM entities WHERE name = ?2",
            params![id, entity.name],
        )?;
    }

    tx.commit()?;
    Ok((id, !existed))
}

fn remove_orphan_entities(conn: &Connection) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM entities WHERE id NOT IN (SELECT entity_id FROM mentions)",
        [],
    )
}

#[async_trait]
impl MemoryBackend for SqliteBackend {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn initialize(&self) -> Result<()> {
        self.run(|conn| {
            let mode: String =
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |r| r.get(0))?;
            tracing::debug!("SQLite journal mode: {}", mode);
            with_busy_retry(|| conn.execute_batch(SCHEMA))?;
            Ok(())
        })
        .await
    }

    async fn put(&self, memory: &Memory) -> Result<PutOutcome> {
        let memory = memory.clone();
        let (id, inserted) = self
            .run(move |conn| Ok(with_busy_retry(|| put_memory(conn, &memory))?))
            .await?;
        let id = Uuid::parse_str(&id)
            .map_err(|e| MemoraError::Database(format!("Invalid memory id {id}: {e}")))?;
        Ok(PutOutcome { id, inserted })
    }

    async fn get_by_id(&self, id: Uuid, now: DateTime<Utc>) -> Result<Option<Memory>> {
        let now = now.timestamp_micros();
        let memories = self
            .run(move |conn| {
                query_memories(
                    conn,
                    &format!(
                        "SELECT {MEMORY_COLUMNS} FROM memories m
                          WHERE m.id = ?1 AND (m.valid_to IS NULL OR m.valid_to > ?2)"
                    ),
                    params![id.to_string(), now],
                )
            })
            .await?;
        Ok(memories.into_iter().next())
    }

    async fn get_by_entity(&self, name: &str, now: DateTime<Utc>) -> Result<Vec<Memory>> {
        let name = name.trim().to_string();
        let now = now.timestamp_micros();
        self.run(move |conn| {
            query_memories(
                conn,
                &format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories m
                       JOIN mentions mn ON mn.memory_id = m.id
                       JOIN entities e ON e.id = mn.entity_id
                      WHERE e.name = ?1 AND (m.valid_to IS NULL OR m.valid_to > ?2)
                      ORDER BY m.created_at DESC, m.id ASC"
                ),
                params![name, now],
            )
        })
        .await
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

        let mut values = vec![Value::Integer(now.timestamp_micros())];
        let like_clauses = vec!["m.content LIKE ? ESCAPE '\\'"; terms.len()].join(" OR ");
        values.extend(
            terms
                .iter()
                .map(|t| Value::Text(format!("%{}%", escape_like(t)))),
        );
        let name_placeholders = vec!["?"; terms.len()].join(", ");
        values.extend(terms.iter().map(|t| Value::Text(t.clone())));

        let mut sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories m
              WHERE (m.valid_to IS NULL OR m.valid_to > ?)
                AND ({like_clauses} OR m.id IN (
                    SELECT mn.memory_id FROM mentions mn
                      JOIN entities e ON e.id = mn.entity_id
                     WHERE e.name IN ({name_placeholders})))"
        );
        if let Some((clause, params)) = filter.to_sql_clause() {
            sql.push_str(" AND ");
            sql.push_str(&clause);
            values.extend(params);
        }
        sql.push_str(" ORDER BY m.importance DESC, m.updated_at DESC, m.id ASC LIMIT ?");
        values.push(Value::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));

        self.run(move |conn| query_memories(conn, &sql, rusqlite::params_from_iter(values)))
            .await
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let now = now.timestamp_micros();
        self.run(move |conn| {
            let removed = with_busy_retry(|| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let mut removed = 0;
                // Per type so the sweep walks idx_memories_type_valid_to
                for memory_type in MemoryType::ALL {
                    removed += tx.execute(
                        "DELETE FROM memories
                          WHERE memory_type = ?1 AND valid_to IS NOT NULL AND valid_to < ?2",
                        params![memory_type.as_str(), now],
                    )?;
                }
                remove_orphan_entities(&tx)?;
                tx.commit()?;
                Ok(removed)
            })?;
            Ok(removed)
        })
        .await
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        self.run(move |conn| {
            let removed = with_busy_retry(|| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let removed = tx.execute("DELETE FROM memories WHERE id = ?1", [id.to_string()])?;
                remove_orphan_entities(&tx)?;
                tx.commit()?;
                Ok(removed)
            })?;
            Ok(removed > 0)
        })
        .await
    }

    async fn count(&self) -> Result<usize> {
        self.run(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM memories", [], |r| r.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn schema_version(&self) -> Result<Option<String>> {
        self.run(|conn| {
            let has_system: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'system')",
                [],
                |r| r.get(0),
            )?;
            if !has_system {
                return Ok(None);
            }
            let version = conn
                .query_row(
                    "SELECT value FROM system WHERE key = ?1",
                    [SCHEMA_VERSION_KEY],
                    |r| r.get(0),
                )
                .optional()?;
            Ok(version)
        })
        .await
    }

    async fn set_schema_version(&self, version: &str) -> Result<()> {
        let version = version.to_string();
        self.run(move |conn| {
            with_busy_retry(|| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS system (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
                )?;
                conn.execute(
                    "INSERT INTO system (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![SCHEMA_VERSION_KEY, version],
                )
            })?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_backend() -> (SqliteBackend, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(temp_dir.path().join("test.db"), Duration::from_secs(5));
        backend.initialize().await.unwrap();
        (backend, temp_dir)
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("plain"), "plain");
        assert_eq!(escape_like("100%"), "100\\%");
        assert_eq!(escape_like("snake_case"), "snake\\_case");
        assert_eq!(escape_like("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_load_entities_batches_across_chunks() {
        let temp_dir = TempDir::new().unwrap();
        let mut conn = Connection::open(temp_dir.path().join("batch.db")).unwrap();
        conn.execute_batch(SCHEMA).unwrap();

        let mut tagged = Memory::new("Kafka feeds ClickHouse", MemoryType::Decision);
        tagged.add_entity(Entity::new("Kafka", "technology"));
        tagged.add_entity(Entity::new("ClickHouse", "technology"));
        let plain = Memory::new("Standup is at ten", MemoryType::Context);
        let (tagged_id, _) = put_memory(&mut conn, &tagged).unwrap();
        let (plain_id, _) = put_memory(&mut conn, &plain).unwrap();

        // Real ids on both sides of a chunk boundary
        let filler: Vec<String> = (0..ENTITY_BATCH).map(|i| format!("missing-{i}")).collect();
        let mut ids: Vec<&str> = vec![plain_id.as_str()];
        ids.extend(filler.iter().map(String::as_str));
        ids.push(tagged_id.as_str());

        let entities = load_entities(&conn, &ids).unwrap();
        assert_eq!(entities.len(), 1);
        assert_eq!(
            entities[&tagged_id],
            vec![
                Entity::new("ClickHouse", "technology"),
                Entity::new("Kafka", "technology")
            ]
        );
        assert!(!entities.contains_key(&plain_id));
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent() {
        let (backend, _temp_dir) = create_backend().await;
        backend.initialize().await.unwrap();
        assert_eq!(backend.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_schema_version_absent_before_initialize() {
        let temp_dir = TempDir::new().unwrap();
        let backend = SqliteBackend::new(temp_dir.path().join("fresh.db"), Duration::from_secs(1));

        assert_eq!(backend.schema_version().await.unwrap(), None);
        backend.set_schema_version("1.0.0").await.unwrap();
        backend.set_schema_version("1.1.0").await.unwrap();
        assert_eq!(
            backend.schema_version().await.unwrap(),
            Some("1.1.0".to_string())
        );
    }

    #[tokio::test]
    async fn test_roundtrip_preserves_fields() {
        let (backend, _temp_dir) = create_backend().await;

        let mut memory = Memory::new("Deploys go through the staging cluster", MemoryType::Pattern);
        memory.importance = 0.6;
        memory.confidence = 0.75;
        memory.agent_id = "ops".to_string();
        memory
            .metadata
            .insert("source".to_string(), serde_json::json!("chat"));
        memory.add_entity(Entity::new("staging", "environment"));
        memory.valid_to = Some(memory.created_at + chrono::Duration::days(30));

        let outcome = backend.put(&memory).await.unwrap();
        assert!(outcome.inserted);

        let stored = backend
            .get_by_id(outcome.id, Utc::now())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.content, memory.content);
        assert_eq!(stored.memory_type, MemoryType::Pattern);
        assert_eq!(stored.importance, 0.6);
        assert_eq!(stored.confidence, 0.75);
        assert_eq!(stored.agent_id, "ops");
        assert_eq!(stored.metadata["source"], "chat");
        assert_eq!(stored.entities, vec![Entity::new("staging", "environment")]);
        assert_eq!(
            stored.created_at.timestamp_micros(),
            memory.created_at.timestamp_micros()
        );
        assert_eq!(
            stored.valid_to.map(|t| t.timestamp_micros()),
            memory.valid_to.map(|t| t.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn test_search_treats_wildcards_literally() {
        let (backend, _temp_dir) = create_backend().await;
        backend
            .put(&Memory::new("Coverage sits at 80 percent", MemoryType::Status))
            .await
            .unwrap();

        let hits = backend
            .search(&["%".to_string()], &MemoryFilter::new(), 10, Utc::now())
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
