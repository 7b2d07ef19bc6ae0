//! Test utilities for memora - classifier mocks and config helpers
//!
//! Mock classifiers make ingestion deterministic in tests:
//! - [`StaticClassifier`] always returns the same classification
//! - [`FailingClassifier`] always errors
//! - [`SlowClassifier`] sleeps past any reasonable timeout

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::classifier::{Classification, Classifier, ClassifierError, extract_entities};
use crate::config::{BackendKind, Config};
use crate::memory::types::MemoryType;

/// Config rooted at `dir` with a fast poll interval for tests
pub fn test_config(dir: &Path, backend: BackendKind) -> Config {
    let mut config = Config::with_data_dir(dir);
    config.storage.backend = backend;
    config.queue.poll_interval_ms = 10;
    config.queue.classifier_timeout_ms = 200;
    config
}

/// Classifier that returns a fixed type and confidence, and counts calls
#[derive(Debug)]
pub struct StaticClassifier {
    memory_type: MemoryType,
    confidence: f32,
    calls: AtomicUsize,
}

impl StaticClassifier {
    pub fn new(memory_type: MemoryType, confidence: f32) -> Self {
        Self {
            memory_type,
            confidence,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of classify calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for StaticClassifier {
    async fn classify(&self, content: &str) -> Result<Classification, ClassifierError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Classification::new(
            self.memory_type,
            self.confidence,
            extract_entities(content),
        ))
    }

    fn name(&self) -> &'static str {
        "static"
    }
}

/// Classifier that is never available
#[derive(Debug, Default)]
pub struct FailingClassifier;

#[async_trait]
impl Classifier for FailingClassifier {
    async fn classify(&self, _content: &str) -> Result<Classification, ClassifierError> {
        Err(ClassifierError::Unavailable("mock outage".to_string()))
    }

    fn name(&self) -> &'static str {
        "failing"
    }
}

/// Classifier that takes `delay` before answering `context`
#[derive(Debug)]
pub struct SlowClassifier {
    delay: Duration,
}

impl SlowClassifier {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Classifier for SlowClassifier {
    async fn classify(&self, content: &str) -> Result<Classification, ClassifierError> {
        tokio::time::sleep(self.delay).await;
        Ok(Classification::new(
            MemoryType::Context,
            1.0,
            extract_entities(content),
        ))
    }

    fn name(&self) -> &'static str {
        "slow"
    }
}
