//! Content classification
//!
//! Ingestion consumes classification only through the [`Classifier`]
//! trait. [`classify_with_fallback`] bounds a call with a timeout and
//! degrades to a low-confidence `context` result so that a missing or slow
//! classifier never blocks ingestion.

pub mod keyword;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::MemoraError;
use crate::memory::types::MemoryType;

pub use keyword::{KeywordClassifier, extract_entities};
pub use types::{Classification, ClassifierError};

/// Confidence assigned when the classifier could not be used
pub const FALLBACK_CONFIDENCE: f32 = 0.3;

/// Trait for classification providers
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Decide the memory type, confidence and mentioned entities
    async fn classify(&self, content: &str) -> Result<Classification, ClassifierError>;

    /// Provider name for logging
    fn name(&self) -> &'static str;
}

/// Heuristic result used when the classifier fails or times out
pub fn fallback_classification(content: &str) -> Classification {
    Classification::new(
        MemoryType::Context,
        FALLBACK_CONFIDENCE,
        extract_entities(content),
    )
}

/// Classify `content`, falling back to [`fallback_classification`] on
/// error or when `timeout` elapses
pub async fn classify_with_fallback(
    classifier: &dyn Classifier,
    content: &str,
    timeout: Duration,
) -> Classification {
    let error = match tokio::time::timeout(timeout, classifier.classify(content)).await {
        Ok(Ok(classification)) => {
            debug!(
                "{} classified content as {} ({:.2})",
                classifier.name(),
                classification.memory_type,
                classification.confidence
            );
            return classification;
        }
        Ok(Err(e)) => e,
        Err(_) => ClassifierError::Timeout(timeout.as_millis() as u64),
    };

    let error = MemoraError::Integration(format!("{}: {}", classifier.name(), error));
    warn!("{}, falling back to context", error);
    fallback_classification(content)
}
