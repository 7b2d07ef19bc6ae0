//! Memory types for the Memora system
//!
//! Defines the core data structures for storing and retrieving memories:
//! the Memory record, its fixed retention category, and the entities it
//! mentions.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{MemoraError, Result};

/// Open key/value bag attached to a memory
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Default attribution for memories written without an agent id
pub const DEFAULT_AGENT_ID: &str = "default";

/// A single memory unit stored in the Memora system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    /// Unique identifier for this memory
    pub id: Uuid,
    /// The actual content of the memory (trimmed, non-empty)
    pub content: String,
    /// SHA-256 hex digest of `content`, the dedup key
    pub content_hash: String,
    /// Retention category, fixed at creation
    pub memory_type: MemoryType,
    /// Importance score in [0, 1]
    pub importance: f32,
    /// Classifier confidence in [0, 1]
    pub confidence: f32,
    /// Which agent recorded this memory
    pub agent_id: String,
    /// Free-form metadata
    pub metadata: Metadata,
    /// Entities mentioned by this memory
    pub entities: Vec<Entity>,
    /// When this memory was first stored
    pub created_at: DateTime<Utc>,
    /// When this memory was last reinforced by re-ingestion
    pub updated_at: DateTime<Utc>,
    /// Expiry time; `None` never expires
    pub valid_to: Option<DateTime<Utc>>,
}

impl Memory {
    /// Create a new memory with default values.
    ///
    /// Content is trimmed and hashed here; importance and expiry are left at
    /// neutral defaults until a [`RetentionPolicy`](crate::memory::RetentionPolicy)
    /// is applied.
    pub fn new(content: &str, memory_type: MemoryType) -> Self {
        let content = content.trim().to_string();
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            content_hash: content_hash(&content),
            content,
            memory_type,
            importance: 0.5,
            confidence: 1.0,
            agent_id: DEFAULT_AGENT_ID.to_string(),
            metadata: Metadata::new(),
            entities: Vec::new(),
            created_at: now,
            updated_at: now,
            valid_to: None,
        }
    }

    /// Update the importance of this memory
    pub fn set_importance(&mut self, importance: f32) {
        self.importance = importance.clamp(0.0, 1.0);
    }

    /// Update the confidence of this memory
    pub fn set_confidence(&mut self, confidence: f32) {
        self.confidence = confidence.clamp(0.0, 1.0);
    }

    /// Attach an entity mention, ignoring case-insensitive duplicates
    pub fn add_entity(&mut self, entity: Entity) {
        if !self
            .entities
            .iter()
            .any(|e| e.name.eq_ignore_ascii_case(&entity.name))
        {
            self.entities.push(entity);
        }
    }

    /// Whether this memory has expired at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.valid_to.is_some_and(|valid_to| now > valid_to)
    }

    /// Check the record invariants and normalize scores in place.
    ///
    /// Run by the store before every write.
    pub fn validate(&mut self) -> Result<()> {
        let trimmed = self.content.trim();
        if trimmed.is_empty() {
            return Err(MemoraError::Validation(
                "Memory content cannot be empty".to_string(),
            ));
        }
        if trimmed.len() != self.content.len() {
            self.content = trimmed.to_string();
        }
        self.content_hash = content_hash(&self.content);

        if !self.importance.is_finite() || !self.confidence.is_finite() {
            return Err(MemoraError::Validation(format!(
                "Scores must be finite (importance={}, confidence={})",
                self.importance, self.confidence
            )));
        }
        self.importance = self.importance.clamp(0.0, 1.0);
        self.confidence = self.confidence.clamp(0.0, 1.0);

        if let Some(valid_to) = self.valid_to {
            if valid_to < self.created_at {
                return Err(MemoraError::Validation(format!(
                    "valid_to ({valid_to}) precedes created_at ({})",
                    self.created_at
                )));
            }
        }
        if self.updated_at < self.created_at {
            self.updated_at = self.created_at;
        }

        for entity in &mut self.entities {
            entity.name = entity.name.trim().to_string();
            if entity.name.is_empty() {
                return Err(MemoraError::Validation(
                    "Entity names cannot be empty".to_string(),
                ));
            }
        }

        if self.agent_id.trim().is_empty() {
            self.agent_id = DEFAULT_AGENT_ID.to_string();
        }

        Ok(())
    }
}

/// Stable digest of memory content, used as the dedup key
pub fn content_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Retention category of a memory.
///
/// Each category has a fixed retention class; see
/// [`RetentionPolicy`](crate::memory::RetentionPolicy).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryType {
    /// Who the user or agent is
    Identity,
    /// Stable likes and dislikes
    Preference,
    /// Choices that were made
    Decision,
    /// Fixes and answers that worked
    Solution,
    /// Recurring conventions
    Pattern,
    /// Short-lived situational context
    Context,
    /// Current state of something in flight
    Status,
}

impl MemoryType {
    /// All categories, most durable first
    pub const ALL: [MemoryType; 7] = [
        MemoryType::Identity,
        MemoryType::Preference,
        MemoryType::Decision,
        MemoryType::Solution,
        MemoryType::Pattern,
        MemoryType::Context,
        MemoryType::Status,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MemoryType::Identity => "identity",
            MemoryType::Preference => "preference",
            MemoryType::Decision => "decision",
            MemoryType::Solution => "solution",
            MemoryType::Pattern => "pattern",
            MemoryType::Context => "context",
            MemoryType::Status => "status",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemoryType {
    type Err = MemoraError;

    fn from_str(s: &str) -> Result<Self> {
        MemoryType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| MemoraError::Validation(format!("Unknown memory type: {s}")))
    }
}

/// A named object referenced by one or more memories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Unique name (compared case-insensitively)
    pub name: String,
    /// Free-form kind, e.g. "technology" or "person"
    pub entity_type: String,
}

impl Entity {
    pub fn new(name: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entity_type: entity_type.into(),
        }
    }

    /// Normalized lookup key for this entity name
    pub fn key(name: &str) -> String {
        name.trim().to_lowercase()
    }
}
