//! Classifier types
//!
//! The classification result handed back to ingestion and the errors a
//! classifier may raise.

use crate::memory::types::{Entity, MemoryType};

/// Outcome of classifying one piece of content
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    /// Retention category for the memory
    pub memory_type: MemoryType,
    /// Classifier confidence 0.0-1.0
    pub confidence: f32,
    /// Entities mentioned in the content
    pub entities: Vec<Entity>,
}

impl Classification {
    /// Create a new classification with clamped confidence
    pub fn new(memory_type: MemoryType, confidence: f32, entities: Vec<Entity>) -> Self {
        Self {
            memory_type,
            confidence: confidence.clamp(0.0, 1.0),
            entities,
        }
    }
}

/// Classifier-specific errors
#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier unavailable: {0}")]
    Unavailable(String),
    #[error("Classification failed: {0}")]
    Failed(String),
    #[error("Classifier timed out after {0} ms")]
    Timeout(u64),
}
