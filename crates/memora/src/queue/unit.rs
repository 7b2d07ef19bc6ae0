//! Ingestion unit: one learned fact waiting to be classified and stored

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::{Classification, Classifier, classify_with_fallback, extract_entities};
use crate::memory::types::{Memory, MemoryType, Metadata};
use crate::memory::RetentionPolicy;

/// Metadata key recording where a memory came from
pub const SOURCE_METADATA_KEY: &str = "source";

/// Confidence given to caller-supplied type hints
pub const HINTED_CONFIDENCE: f32 = 1.0;

/// JSON document written to the queue for each `learn` call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionUnit {
    /// Raw content to remember
    pub content: String,
    /// Producer label, e.g. "chat" or "cli"
    pub source: String,
    /// When the producer observed the fact
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Type hint; skips the classifier when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Explicit expiry overriding the retention policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_to: Option<DateTime<Utc>>,
}

impl IngestionUnit {
    pub fn new(content: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            source: source.into(),
            timestamp: Utc::now(),
            metadata: None,
            memory_type: None,
            agent_id: None,
            valid_to: None,
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

    /// Classification for this unit: the type hint when present, otherwise
    /// `classifier` bounded by `timeout` with the usual fallback.
    pub async fn classify(
        &self,
        classifier: &dyn Classifier,
        timeout: Duration,
    ) -> Classification {
        match self.memory_type {
            Some(memory_type) => Classification::new(
                memory_type,
                HINTED_CONFIDENCE,
                extract_entities(&self.content),
            ),
            None => classify_with_fallback(classifier, &self.content, timeout).await,
        }
    }

    /// Build the memory record for this unit.
    ///
    /// Creation time is the unit's timestamp, so reprocessing the same unit
    /// after a crash produces an identical record.
    pub fn into_memory(
        self,
        classification: Classification,
        retention: &RetentionPolicy,
    ) -> Memory {
        let mut memory = Memory::new(&self.content, classification.memory_type);
        memory.created_at = self.timestamp;
        memory.updated_at = self.timestamp;
        memory.valid_to = self.valid_to;
        retention.apply(&mut memory);
        memory.set_confidence(classification.confidence);

        for entity in classification.entities {
            memory.add_entity(entity);
        }

        memory.metadata = self.metadata.unwrap_or_default();
        memory
            .metadata
            .entry(SOURCE_METADATA_KEY.to_string())
            .or_insert_with(|| serde_json::Value::String(self.source));

        if let Some(agent_id) = self.agent_id {
            memory.agent_id = agent_id;
        }
        memory
    }
}
