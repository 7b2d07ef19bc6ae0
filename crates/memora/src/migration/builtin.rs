//! Built-in migration steps

use std::path::Path;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::{MemoraError, Result};
use crate::migration::{Migration, MigrationContext};

/// 0.0.0 -> 1.0.0: create tables and indices
pub struct InitializeSchema;

#[async_trait]
impl Migration for InitializeSchema {
    fn from_version(&self) -> &str {
        "0.0.0"
    }

    fn to_version(&self) -> &str {
        "1.0.0"
    }

    fn description(&self) -> &str {
        "initialize storage schema"
    }

    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        ctx.backend.initialize().await
    }
}

/// 1.0.0 -> 1.1.0: older queues kept unit files directly in the queue
/// directory; move them under `pending/`
pub struct MoveLegacyQueueUnits;

#[async_trait]
impl Migration for MoveLegacyQueueUnits {
    fn from_version(&self) -> &str {
        "1.0.0"
    }

    fn to_version(&self) -> &str {
        "1.1.0"
    }

    fn description(&self) -> &str {
        "move legacy queue units into pending/"
    }

    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        let queue_dir = ctx.queue_dir.clone();
        let moved = tokio::task::spawn_blocking(move || move_legacy_units(&queue_dir))
            .await
            .map_err(|e| MemoraError::Migration(format!("Queue migration task failed: {e}")))??;
        if moved > 0 {
            info!("Moved {} legacy queue units into pending/", moved);
        }
        Ok(())
    }
}

fn move_legacy_units(queue_dir: &Path) -> Result<usize> {
    if !queue_dir.is_dir() {
        return Ok(0);
    }

    let pending = queue_dir.join("pending");
    let mut moved = 0;
    for entry in std::fs::read_dir(queue_dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().is_none_or(|ext| ext != "json") {
            continue;
        }
        let Some(name) = path.file_name() else {
            continue;
        };
        std::fs::create_dir_all(&pending)?;
        std::fs::rename(&path, pending.join(name)).map_err(|e| {
            MemoraError::Migration(format!("Failed to move {}: {e}", path.display()))
        })?;
        moved += 1;
    }
    Ok(moved)
}

/// 1.1.0 -> 1.2.0: `[queue] interval_ms` became `poll_interval_ms`
pub struct RenameQueueIntervalKey;

#[async_trait]
impl Migration for RenameQueueIntervalKey {
    fn from_version(&self) -> &str {
        "1.1.0"
    }

    fn to_version(&self) -> &str {
        "1.2.0"
    }

    fn description(&self) -> &str {
        "rename [queue] interval_ms to poll_interval_ms"
    }

    async fn apply(&self, ctx: &MigrationContext) -> Result<()> {
        let path = ctx.data_dir.join("config.toml");
        if !path.exists() {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let mut table: toml::Table = content.parse().map_err(|e| {
            MemoraError::Migration(format!("Failed to parse {}: {e}", path.display()))
        })?;

        let Some(queue) = table.get_mut("queue").and_then(|q| q.as_table_mut()) else {
            return Ok(());
        };
        let Some(interval) = queue.remove("interval_ms") else {
            debug!("{} already uses poll_interval_ms", path.display());
            return Ok(());
        };
        queue.entry("poll_interval_ms").or_insert(interval);

        ctx.backup_file(&path, self.to_version())?;

        let rendered = toml::to_string(&table).map_err(|e| {
            MemoraError::Migration(format!("Failed to render {}: {e}", path.display()))
        })?;
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &path).await?;

        info!("Renamed queue.interval_ms in {}", path.display());
        Ok(())
    }
}
