//! Integration tests for migrations run on store open

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tempfile::tempdir;

use memora::config::{BackendKind, Config};
use memora::error::{MemoraError, Result};
use memora::memory::{Memory, MemoryType};
use memora::migration::{Migration, MigrationContext, MigrationManager};
use memora::queue::IngestionUnit;
use memora::store::MemoryStore;
use memora::testing::{StaticClassifier, test_config};
use memora::Memora;

/// Step that fails while `fail` is set
struct FlakyStep {
    attempts: Arc<AtomicUsize>,
    fail: bool,
}

#[async_trait]
impl Migration for FlakyStep {
    fn from_version(&self) -> &str {
        "1.2.0"
    }

    fn to_version(&self) -> &str {
        "1.3.0"
    }

    fn description(&self) -> &str {
        "flaky test step"
    }

    async fn apply(&self, _ctx: &MigrationContext) -> Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(MemoraError::Migration("disk on fire".to_string()));
        }
        Ok(())
    }
}

fn sqlite_config(dir: &std::path::Path) -> Config {
    test_config(dir, BackendKind::Sqlite)
}

#[tokio::test]
async fn test_first_open_applies_builtin_chain() {
    let dir = tempdir().unwrap();
    let store = MemoryStore::open(&sqlite_config(dir.path())).await.unwrap();

    let report = store.migration_report();
    assert!(report.is_success());
    assert_eq!(report.starting_version, "0.0.0");
    assert_eq!(report.current_version, MigrationManager::with_builtin().latest_version());
    assert_eq!(report.applied, vec!["1.0.0", "1.1.0", "1.2.0"]);
}

#[tokio::test]
async fn test_reopen_is_a_no_op() {
    let dir = tempdir().unwrap();
    let config = sqlite_config(dir.path());

    let first = MemoryStore::open(&config).await.unwrap();
    first
        .put(Memory::new("We use Rust", MemoryType::Decision))
        .await
        .unwrap();
    drop(first);

    let second = MemoryStore::open(&config).await.unwrap();
    let report = second.migration_report();
    assert!(report.is_success());
    assert!(report.applied.is_empty());
    assert_eq!(report.starting_version, "1.2.0");
    assert_eq!(second.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_failed_step_does_not_advance_and_retries() {
    let dir = tempdir().unwrap();
    let config = sqlite_config(dir.path());
    let attempts = Arc::new(AtomicUsize::new(0));

    let failing = MigrationManager::with_builtin().register(FlakyStep {
        attempts: Arc::clone(&attempts),
        fail: true,
    });
    let store = MemoryStore::open_with_migrations(&config, &failing)
        .await
        .unwrap();

    let report = store.migration_report();
    assert!(!report.is_success());
    assert_eq!(report.current_version, "1.2.0");
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.to_version, "1.3.0");
    assert!(failure.error.contains("disk on fire"));

    // Still usable on the prior version
    let id = store
        .put(Memory::new("Store still works", MemoryType::Context))
        .await
        .unwrap();
    assert!(store.get_by_id(id).await.unwrap().is_some());
    drop(store);

    let healed = MigrationManager::with_builtin().register(FlakyStep {
        attempts: Arc::clone(&attempts),
        fail: false,
    });
    let store = MemoryStore::open_with_migrations(&config, &healed)
        .await
        .unwrap();
    assert_eq!(store.migration_report().applied, vec!["1.3.0"]);
    assert_eq!(store.migration_report().current_version, "1.3.0");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_legacy_queue_units_are_moved_and_processed() {
    let dir = tempdir().unwrap();
    let config = sqlite_config(dir.path());

    let queue_dir = config.queue_dir();
    std::fs::create_dir_all(&queue_dir).unwrap();
    let unit = IngestionUnit::new("Legacy fact from the old layout", "chat");
    std::fs::write(
        queue_dir.join("00000000000000000001-legacy.json"),
        serde_json::to_vec(&unit).unwrap(),
    )
    .unwrap();

    let memora = Memora::open_with_classifier(
        config,
        Arc::new(StaticClassifier::new(MemoryType::Context, 0.5)),
    )
    .await
    .unwrap();
    assert_eq!(memora.queue().depth().unwrap(), 1);

    memora.processor().drain_once().await.unwrap();
    assert_eq!(memora.store().count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_legacy_config_key_is_renamed_with_backup() {
    let dir = tempdir().unwrap();
    let config_path = dir.path().join("config.toml");
    std::fs::write(&config_path, "[queue]\ninterval_ms = 250\n").unwrap();

    // First start after upgrade: the old key is read before migrations run
    let before = Config::from_file(&config_path).unwrap();
    assert_eq!(before.queue.poll_interval_ms, 250);

    MemoryStore::open(&sqlite_config(dir.path())).await.unwrap();

    let rewritten: toml::Table = std::fs::read_to_string(&config_path)
        .unwrap()
        .parse()
        .unwrap();
    let queue = rewritten["queue"].as_table().unwrap();
    assert!(!queue.contains_key("interval_ms"));
    assert_eq!(queue["poll_interval_ms"].as_integer(), Some(250));
    assert_eq!(Config::from_file(&config_path).unwrap().queue.poll_interval_ms, 250);

    let backup = std::fs::read_to_string(dir.path().join("config.toml.bak-1.2.0")).unwrap();
    assert!(backup.starts_with("[queue]\ninterval_ms = 250"));
}
