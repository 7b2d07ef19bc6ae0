//! Background consumer for the ingestion queue
//!
//! One tokio task per store. Each poll drains every pending unit:
//! parse, classify (bounded by a timeout), apply retention, upsert, then
//! delete the unit. Anything that fails lands in `failed/` with its reason
//! and never stops the loop. The same task runs the periodic expiry sweep.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::classifier::Classifier;
use crate::config::QueueConfig;
use crate::error::{MemoraError, Result};
use crate::queue::{IngestionQueue, QueuedUnit};
use crate::store::MemoryStore;

/// tmp/ files older than this are leftovers from a crashed producer
const STALE_TMP_AGE: Duration = Duration::from_secs(60);

/// Result of one pass over the pending units
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    /// Units stored and removed
    pub processed: usize,
    /// Units moved to `failed/`
    pub failed: usize,
    /// Units still pending after the pass
    pub remaining: usize,
}

pub struct QueueProcessor {
    queue: IngestionQueue,
    store: Arc<MemoryStore>,
    classifier: Arc<dyn Classifier>,
    config: QueueConfig,
}

impl QueueProcessor {
    pub fn new(
        queue: IngestionQueue,
        store: Arc<MemoryStore>,
        classifier: Arc<dyn Classifier>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queue,
            store,
            classifier,
            config,
        }
    }

    /// Process every currently pending unit once
    pub async fn drain_once(&self) -> Result<DrainStats> {
        self.drain(None).await
    }

    async fn drain(&self, stop: Option<&watch::Receiver<bool>>) -> Result<DrainStats> {
        let pending = self.queue.pending()?;
        if pending.len() > self.config.max_pending {
            warn!(
                "Ingestion queue backlog: {} pending units (max_pending {})",
                pending.len(),
                self.config.max_pending
            );
        }

        let mut stats = DrainStats::default();
        for unit in &pending {
            if stop.is_some_and(|rx| *rx.borrow()) {
                debug!("Stop requested, leaving remaining units pending");
                break;
            }

            match self.process(unit).await {
                Ok(()) => stats.processed += 1,
                Err(e) => {
                    if self.queue.fail(unit, &e.to_string())? {
                        stats.failed += 1;
                    }
                }
            }
        }

        stats.remaining = self.queue.depth()?;
        if stats.processed > 0 || stats.failed > 0 {
            debug!(
                "Drained queue: {} processed, {} failed, {} remaining",
                stats.processed, stats.failed, stats.remaining
            );
        }
        Ok(stats)
    }

    async fn process(&self, unit: &QueuedUnit) -> Result<()> {
        let parsed = self.queue.read(unit)?;
        if parsed.content.trim().is_empty() {
            return Err(MemoraError::Validation(
                "Ingestion unit has empty content".to_string(),
            ));
        }

        let classification = parsed
            .classify(self.classifier.as_ref(), self.config.classifier_timeout())
            .await;

        let memory = parsed.into_memory(classification, self.store.retention());
        let outcome = self.store.upsert(memory).await?;
        self.queue.complete(unit)?;

        debug!(
            "Unit {} -> memory {} ({})",
            unit.id(),
            outcome.id,
            if outcome.inserted { "new" } else { "merged" }
        );
        Ok(())
    }

    /// Start the polling loop on a background task
    pub fn spawn(self) -> ProcessorHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(stop_rx));
        ProcessorHandle {
            stop: stop_tx,
            handle,
        }
    }

    /// Like [`spawn`](Self::spawn), but refuses to start while another loop
    /// holding the same `running` flag is alive. The flag is released when
    /// the loop exits.
    pub fn spawn_exclusive(self, running: Arc<AtomicBool>) -> Result<ProcessorHandle> {
        if running.swap(true, Ordering::AcqRel) {
            return Err(MemoraError::Queue(
                "Queue processor is already running for this store".to_string(),
            ));
        }

        let flag = RunningFlag(running);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let _flag = flag;
            self.run(stop_rx).await;
        });
        Ok(ProcessorHandle {
            stop: stop_tx,
            handle,
        })
    }

    async fn run(self, mut stop: watch::Receiver<bool>) {
        info!(
            "Queue processor started ({} classifier, polling every {:?})",
            self.classifier.name(),
            self.config.poll_interval()
        );

        if let Err(e) = self.queue.purge_stale_tmp(STALE_TMP_AGE) {
            warn!("Failed to purge stale queue files: {}", e);
        }

        let mut poll = tokio::time::interval(self.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_sweep = Instant::now();

        loop {
            tokio::select! {
                _ = poll.tick() => {}
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
            if *stop.borrow() {
                break;
            }

            if let Err(e) = self.drain(Some(&stop)).await {
                error!("Queue drain failed: {}", e);
            }

            if let Some(sweep_interval) = self.config.sweep_interval() {
                if last_sweep.elapsed() >= sweep_interval {
                    last_sweep = Instant::now();
                    if let Err(e) = self.store.delete_expired().await {
                        warn!("Expiry sweep failed: {}", e);
                    }
                }
            }
        }

        info!("Queue processor stopped");
    }
}

/// Clears the shared running flag when the loop exits, even on panic
struct RunningFlag(Arc<AtomicBool>);

impl Drop for RunningFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Owner of a running [`QueueProcessor`]. Dropping it also stops the loop.
pub struct ProcessorHandle {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl ProcessorHandle {
    /// Ask the loop to stop and wait for it. The unit in flight finishes;
    /// no new unit starts.
    pub async fn stop(self) -> Result<()> {
        let _ = self.stop.send(true);
        self.handle
            .await
            .map_err(|e| MemoraError::Queue(format!("Queue processor task failed: {e}")))
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
