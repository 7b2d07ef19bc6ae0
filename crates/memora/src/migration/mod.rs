//! Versioned schema and data migrations
//!
//! The store persists the last applied version next to its data. On every
//! open the [`MigrationManager`] walks its registry from that version,
//! applying each step whose `from_version` matches, and stops at the first
//! failure. The version only advances after a step succeeds, so a failed
//! step is retried on the next open and the store keeps serving on the
//! version it had.

mod builtin;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{MemoraError, Result};
use crate::storage::MemoryBackend;

pub use builtin::{InitializeSchema, MoveLegacyQueueUnits, RenameQueueIntervalKey};

/// Version assumed when nothing has been persisted yet
pub const INITIAL_VERSION: &str = "0.0.0";

/// One step in the migration chain. Must be idempotent.
#[async_trait]
pub trait Migration: Send + Sync {
    /// Version this step upgrades from
    fn from_version(&self) -> &str;

    /// Version this step leaves the store at
    fn to_version(&self) -> &str;

    /// Human readable summary for logs
    fn description(&self) -> &str;

    async fn apply(&self, ctx: &MigrationContext) -> Result<()>;
}

/// Everything a migration may touch
pub struct MigrationContext {
    pub data_dir: PathBuf,
    pub queue_dir: PathBuf,
    pub backend: Arc<dyn MemoryBackend>,
}

impl MigrationContext {
    pub fn new(config: &Config, backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            data_dir: config.storage.data_dir.clone(),
            queue_dir: config.queue_dir(),
            backend,
        }
    }

    /// Copy `path` to `<path>.bak-<to_version>` before it is overwritten.
    ///
    /// Returns `None` when there is nothing to back up. An existing backup
    /// is left alone so re-running a step keeps the original copy.
    pub fn backup_file(&self, path: &Path, to_version: &str) -> Result<Option<PathBuf>> {
        if !path.exists() {
            return Ok(None);
        }

        let file_name = path
            .file_name()
            .ok_or_else(|| MemoraError::Migration(format!("Not a file: {}", path.display())))?;
        let mut backup_name = file_name.to_os_string();
        backup_name.push(format!(".bak-{to_version}"));
        let backup = path.with_file_name(backup_name);

        if !backup.exists() {
            std::fs::copy(path, &backup).map_err(|e| {
                MemoraError::Migration(format!(
                    "Failed to back up {} to {}: {e}",
                    path.display(),
                    backup.display()
                ))
            })?;
            debug!("Backed up {} to {}", path.display(), backup.display());
        }
        Ok(Some(backup))
    }
}

/// A step that failed, and why
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFailure {
    pub from_version: String,
    pub to_version: String,
    pub error: String,
}

/// Outcome of one migration run
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MigrationReport {
    /// Version persisted before the run
    pub starting_version: String,
    /// Version persisted after the run
    pub current_version: String,
    /// Target versions applied, in order
    pub applied: Vec<String>,
    /// First failure, if the chain stopped early
    pub failure: Option<MigrationFailure>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

/// Ordered registry of migrations
pub struct MigrationManager {
    migrations: Vec<Box<dyn Migration>>,
}

impl Default for MigrationManager {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl MigrationManager {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            migrations: Vec::new(),
        }
    }

    /// Registry holding every built-in step
    pub fn with_builtin() -> Self {
        Self::new()
            .register(InitializeSchema)
            .register(MoveLegacyQueueUnits)
            .register(RenameQueueIntervalKey)
    }

    /// Append a step to the chain
    pub fn register(mut self, migration: impl Migration + 'static) -> Self {
        self.migrations.push(Box::new(migration));
        self
    }

    /// Version reached once every registered step has run
    pub fn latest_version(&self) -> &str {
        self.migrations
            .last()
            .map(|m| m.to_version())
            .unwrap_or(INITIAL_VERSION)
    }

    /// Apply every reachable step starting at the persisted version.
    ///
    /// Failures are logged and reported, never returned as errors.
    pub async fn run(&self, ctx: &MigrationContext) -> MigrationReport {
        let starting_version = match ctx.backend.schema_version().await {
            Ok(version) => version.unwrap_or_else(|| INITIAL_VERSION.to_string()),
            Err(e) => {
                error!("Failed to read schema version: {}", e);
                return MigrationReport {
                    starting_version: INITIAL_VERSION.to_string(),
                    current_version: INITIAL_VERSION.to_string(),
                    applied: Vec::new(),
                    failure: Some(MigrationFailure {
                        from_version: INITIAL_VERSION.to_string(),
                        to_version: INITIAL_VERSION.to_string(),
                        error: e.to_string(),
                    }),
                };
            }
        };

        let mut report = MigrationReport {
            current_version: starting_version.clone(),
            starting_version,
            ..Default::default()
        };

        // Bounded by registry size so a cyclic registry cannot spin forever
        for _ in 0..self.migrations.len() {
            let Some(migration) = self
                .migrations
                .iter()
                .find(|m| m.from_version() == report.current_version)
            else {
                break;
            };

            info!(
                "Applying migration {} -> {}: {}",
                migration.from_version(),
                migration.to_version(),
                migration.description()
            );

            let result = match migration.apply(ctx).await {
                Ok(()) => ctx.backend.set_schema_version(migration.to_version()).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    report.current_version = migration.to_version().to_string();
                    report.applied.push(report.current_version.clone());
                }
                Err(e) => {
                    error!(
                        "Migration {} -> {} failed, staying on {}: {}",
                        migration.from_version(),
                        migration.to_version(),
                        report.current_version,
                        e
                    );
                    report.failure = Some(MigrationFailure {
                        from_version: migration.from_version().to_string(),
                        to_version: migration.to_version().to_string(),
                        error: e.to_string(),
                    });
                    break;
                }
            }
        }

        if report.applied.is_empty() && report.is_success() {
            debug!("Store schema up to date at {}", report.current_version);
        }
        report
    }
}
