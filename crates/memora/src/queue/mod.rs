//! Durable file-backed ingestion queue
//!
//! Layout under the queue directory:
//! - `tmp/` in-progress writes, never read by the consumer
//! - `pending/` complete units, consumed in file-name order
//! - `failed/` units that could not be processed, each with a sibling
//!   `<name>.error` holding the reason
//!
//! A unit becomes visible only through an atomic rename from `tmp/` to
//! `pending/`, and is deleted only after it has been stored. Delivery is
//! at-least-once; the store's content-hash dedup makes replays harmless.

pub mod processor;
pub mod unit;

use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{MemoraError, Result};

pub use processor::{DrainStats, ProcessorHandle, QueueProcessor};
pub use unit::IngestionUnit;

const UNIT_EXTENSION: &str = "json";
const ERROR_SUFFIX: &str = ".error";

/// A unit file in `pending/` or `failed/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedUnit {
    id: String,
    path: PathBuf,
}

impl QueuedUnit {
    /// Sortable unit id (`<micros>-<uuid>`)
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn file_name(&self) -> String {
        format!("{}.{UNIT_EXTENSION}", self.id)
    }
}

/// A unit in the holding area and why it got there
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedUnit {
    pub unit: QueuedUnit,
    pub reason: Option<String>,
}

static LAST_STAMP: AtomicI64 = AtomicI64::new(0);

/// Microsecond timestamp, strictly increasing within this process
fn next_stamp() -> i64 {
    let now = Utc::now().timestamp_micros().max(0);
    let mut last = LAST_STAMP.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_STAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

fn queue_err(action: &str, path: &Path, e: std::io::Error) -> MemoraError {
    MemoraError::Queue(format!("Failed to {action} {}: {e}", path.display()))
}

/// Handle on a queue directory. Cheap to clone paths from; every method
/// goes straight to the filesystem so several processes may share it.
#[derive(Debug, Clone)]
pub struct IngestionQueue {
    root: PathBuf,
    tmp: PathBuf,
    pending: PathBuf,
    failed: PathBuf,
}

impl IngestionQueue {
    /// Open (creating if needed) the queue rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let queue = Self {
            tmp: root.join("tmp"),
            pending: root.join("pending"),
            failed: root.join("failed"),
            root,
        };
        for dir in [&queue.tmp, &queue.pending, &queue.failed] {
            fs::create_dir_all(dir).map_err(|e| queue_err("create", dir, e))?;
        }
        Ok(queue)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Durably hand `unit` to the consumer and return its id.
    ///
    /// Written to `tmp/`, fsynced, then renamed into `pending/`, so the
    /// consumer never sees a partial file.
    pub fn enqueue(&self, unit: &IngestionUnit) -> Result<String> {
        let id = format!("{:020}-{}", next_stamp(), Uuid::new_v4().simple());
        let file_name = format!("{id}.{UNIT_EXTENSION}");
        let tmp_path = self.tmp.join(&file_name);
        let pending_path = self.pending.join(&file_name);

        let body = serde_json::to_vec(unit)?;
        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&body)?;
            file.sync_all()
        });
        if let Err(e) = written.and_then(|()| fs::rename(&tmp_path, &pending_path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(queue_err("enqueue", &pending_path, e));
        }

        debug!("Enqueued ingestion unit {}", id);
        Ok(id)
    }

    fn list(dir: &Path) -> Result<Vec<QueuedUnit>> {
        let mut units = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| queue_err("list", dir, e))? {
            let path = entry.map_err(|e| queue_err("list", dir, e))?.path();
            if path.extension().is_none_or(|ext| ext != UNIT_EXTENSION) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            units.push(QueuedUnit {
                id: id.to_string(),
                path: path.clone(),
            });
        }
        units.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(units)
    }

    /// Pending units in arrival order
    pub fn pending(&self) -> Result<Vec<QueuedUnit>> {
        Self::list(&self.pending)
    }

    /// Number of pending units
    pub fn depth(&self) -> Result<usize> {
        Ok(self.pending()?.len())
    }

    /// Parse a pending unit
    pub fn read(&self, unit: &QueuedUnit) -> Result<IngestionUnit> {
        let body = fs::read(&unit.path).map_err(|e| queue_err("read", &unit.path, e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Remove a unit after it has been stored
    pub fn complete(&self, unit: &QueuedUnit) -> Result<()> {
        match fs::remove_file(&unit.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(queue_err("complete", &unit.path, e)),
        }
    }

    /// Move a unit, untouched, into `failed/` with its failure reason.
    /// Returns false if the unit was already gone.
    pub fn fail(&self, unit: &QueuedUnit, reason: &str) -> Result<bool> {
        let file_name = unit.file_name();
        let target = self.failed.join(&file_name);
        match fs::rename(&unit.path, &target) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Unit {} already gone, not moving to failed/", unit.id);
                return Ok(false);
            }
            Err(e) => return Err(queue_err("fail", &unit.path, e)),
        }

        let error_path = self.failed.join(format!("{file_name}{ERROR_SUFFIX}"));
        fs::write(&error_path, reason).map_err(|e| queue_err("write", &error_path, e))?;
        warn!("Moved unit {} to failed/: {}", unit.id, reason);
        Ok(true)
    }

    /// Units in the holding area, oldest first
    pub fn failed(&self) -> Result<Vec<FailedUnit>> {
        Self::list(&self.failed)?
            .into_iter()
            .map(|unit| {
                let error_path = self
                    .failed
                    .join(format!("{}{ERROR_SUFFIX}", unit.file_name()));
                let reason = match fs::read_to_string(&error_path) {
                    Ok(reason) => Some(reason),
                    Err(e) if e.kind() == ErrorKind::NotFound => None,
                    Err(e) => return Err(queue_err("read", &error_path, e)),
                };
                Ok(FailedUnit { unit, reason })
            })
            .collect()
    }

    /// Move every failed unit back to `pending/`. Returns how many moved.
    pub fn requeue_failed(&self) -> Result<usize> {
        let mut moved = 0;
        for failed in self.failed()? {
            let file_name = failed.unit.file_name();
            let target = self.pending.join(&file_name);
            fs::rename(&failed.unit.path, &target)
                .map_err(|e| queue_err("requeue", &failed.unit.path, e))?;
            let _ = fs::remove_file(self.failed.join(format!("{file_name}{ERROR_SUFFIX}")));
            moved += 1;
        }
        if moved > 0 {
            debug!("Requeued {} failed units", moved);
        }
        Ok(moved)
    }

    /// Delete `tmp/` files older than `max_age`, left behind by a producer
    /// that died mid-write
    pub fn purge_stale_tmp(&self, max_age: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut purged = 0;
        for entry in fs::read_dir(&self.tmp).map_err(|e| queue_err("list", &self.tmp, e))? {
            let entry = entry.map_err(|e| queue_err("list", &self.tmp, e))?;
            let age = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok());
            if age.is_some_and(|age| age >= max_age) && fs::remove_file(entry.path()).is_ok() {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("Purged {} stale tmp files", purged);
        }
        Ok(purged)
    }
}
