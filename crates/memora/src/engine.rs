//! The [`Memora`] facade: `learn` and `recall` over one store
//!
//! Wires config, store, ingestion queue, classifier and recall cache
//! together. Async `learn` only touches the queue directory; the
//! [`QueueProcessor`] started by [`Memora::start_processor`] does the rest.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::classifier::{Classifier, KeywordClassifier};
use crate::config::Config;
use crate::error::Result;
use crate::memory::{MemoryType, Metadata};
use crate::migration::MigrationManager;
use crate::queue::{IngestionQueue, IngestionUnit, ProcessorHandle, QueueProcessor};
use crate::recall::{RecallResult, Recaller};
use crate::store::MemoryStore;

/// A fact to remember
#[derive(Debug, Clone)]
pub struct LearnRequest {
    pub content: String,
    /// Producer label stored under the `source` metadata key
    pub source: String,
    pub metadata: Option<Metadata>,
    /// Skip classification and use this type
    pub memory_type: Option<MemoryType>,
    pub agent_id: Option<String>,
    /// Explicit expiry instead of the type's retention
    pub valid_to: Option<DateTime<Utc>>,
    /// Enqueue and return immediately (default) or store before returning
    pub r#async: bool,
}

impl LearnRequest {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            metadata: None,
            memory_type: None,
            agent_id: None,
            valid_to: None,
            r#async: true,
        }
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn with_memory_type(mut self, memory_type: MemoryType) -> Self {
        self.memory_type = Some(memory_type);
        self
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_valid_to(mut self, valid_to: DateTime<Utc>) -> Self {
        self.valid_to = Some(valid_to);
        self
    }

    /// Store before returning instead of going through the queue
    pub fn synchronous(mut self) -> Self {
        self.r#async = false;
        self
    }

    fn into_unit(self) -> IngestionUnit {
        IngestionUnit {
            content: self.content,
            source: self.source,
            timestamp: Utc::now(),
            metadata: self.metadata,
            memory_type: self.memory_type,
            agent_id: self.agent_id,
            valid_to: self.valid_to,
        }
    }
}

/// Acknowledgement for a [`LearnRequest`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LearnAck {
    /// False when the request was dropped
    pub accepted: bool,
    /// Queue unit id (async requests)
    pub unit_id: Option<String>,
    /// Stored memory id (synchronous requests)
    pub memory_id: Option<Uuid>,
}

impl LearnAck {
    fn dropped() -> Self {
        Self::default()
    }
}

pub struct Memora {
    config: Config,
    store: Arc<MemoryStore>,
    queue: IngestionQueue,
    classifier: Arc<dyn Classifier>,
    recaller: Recaller,
    processor_running: Arc<AtomicBool>,
}

impl Memora {
    /// Open with the built-in keyword classifier
    pub async fn open(config: Config) -> Result<Self> {
        Self::open_with_classifier(config, Arc::new(KeywordClassifier::new())).await
    }

    pub async fn open_with_classifier(
        config: Config,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self> {
        Self::open_with(config, classifier, &MigrationManager::with_builtin()).await
    }

    /// Open with a custom classifier and migration registry
    pub async fn open_with(
        config: Config,
        classifier: Arc<dyn Classifier>,
        migrations: &MigrationManager,
    ) -> Result<Self> {
        let store = Arc::new(MemoryStore::open_with_migrations(&config, migrations).await?);
        let queue = IngestionQueue::open(config.queue_dir())?;
        let recaller = Recaller::new(Arc::clone(&store), config.recall.clone());

        info!(
            "Memora opened at {} ({} classifier)",
            config.storage.data_dir.display(),
            classifier.name()
        );

        Ok(Self {
            config,
            store,
            queue,
            classifier,
            recaller,
            processor_running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn queue(&self) -> &IngestionQueue {
        &self.queue
    }

    /// Remember a fact. Never fails the caller; a request that cannot be
    /// queued or stored comes back with `accepted == false`.
    pub async fn learn(&self, request: LearnRequest) -> LearnAck {
        if request.content.trim().is_empty() {
            debug!("Dropping learn request with empty content");
            return LearnAck::dropped();
        }

        if request.r#async {
            return match self.queue.enqueue(&request.into_unit()) {
                Ok(unit_id) => LearnAck {
                    accepted: true,
                    unit_id: Some(unit_id),
                    memory_id: None,
                },
                Err(e) => {
                    debug!("Dropping learn request: {}", e);
                    LearnAck::dropped()
                }
            };
        }

        match self.learn_now(request.into_unit()).await {
            Ok(memory_id) => LearnAck {
                accepted: true,
                unit_id: None,
                memory_id: Some(memory_id),
            },
            Err(e) => {
                warn!("Synchronous learn failed: {}", e);
                LearnAck::dropped()
            }
        }
    }

    async fn learn_now(&self, unit: IngestionUnit) -> Result<Uuid> {
        let classification = unit
            .classify(self.classifier.as_ref(), self.config.queue.classifier_timeout())
            .await;
        let memory = unit.into_memory(classification, self.store.retention());
        self.store.put(memory).await
    }

    /// Ranked memories relevant to `prompt`
    pub async fn recall(
        &self,
        prompt: &str,
        max_memories: usize,
        timeout: Duration,
    ) -> RecallResult {
        self.recaller.recall(prompt, max_memories, timeout).await
    }

    /// [`recall`](Self::recall) with the configured count and timeout
    pub async fn recall_default(&self, prompt: &str) -> RecallResult {
        let recall = &self.config.recall;
        self.recaller
            .recall(prompt, recall.max_memories, recall.timeout())
            .await
    }

    /// Ranked memories mentioning `name`
    pub async fn recall_entity(
        &self,
        name: &str,
        max_memories: usize,
        timeout: Duration,
    ) -> RecallResult {
        self.recaller
            .recall_entity(name, max_memories, timeout)
            .await
    }

    pub fn recaller(&self) -> &Recaller {
        &self.recaller
    }

    /// Build the background consumer for this instance's queue
    pub fn processor(&self) -> QueueProcessor {
        QueueProcessor::new(
            self.queue.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.classifier),
            self.config.queue.clone(),
        )
    }

    /// Spawn the background consumer. Only one may run per instance; a
    /// second call before the first loop exits is a `Queue` error.
    pub fn start_processor(&self) -> Result<ProcessorHandle> {
        self.processor().spawn_exclusive(Arc::clone(&self.processor_running))
    }
}
