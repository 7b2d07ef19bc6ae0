use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{MemoraError, Result};
use crate::memory::MemoryType;

/// Main configuration structure for Memora
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Persistent storage configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Ingestion queue and background processor configuration
    #[serde(default)]
    pub queue: QueueConfig,
    /// Recall cache configuration
    #[serde(default)]
    pub cache: CacheConfig,
    /// Recall ranking and latency configuration
    #[serde(default)]
    pub recall: RecallConfig,
    /// Per-type retention overrides, keyed by memory type name
    #[serde(default)]
    pub retention: HashMap<String, RetentionOverride>,
}

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists. Falls back to defaults when nothing is found.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".memora").join("config.toml")),
            dirs::config_dir().map(|c| c.join("memora").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Read and validate a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MemoraError::Configuration(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    /// Parse and validate a TOML config document
    pub fn from_toml(content: &str) -> Result<Self> {
        let mut table: toml::Table = content
            .parse()
            .map_err(|e| MemoraError::Configuration(format!("Failed to parse config: {e}")))?;
        apply_legacy_keys(&mut table);

        let config: Config = toml::Value::Table(table)
            .try_into()
            .map_err(|e| MemoraError::Configuration(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Config rooted at `data_dir`, otherwise default. Handy for tests and
    /// embedding Memora in another process.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let mut config = Config::default();
        config.storage.data_dir = data_dir.into();
        config
    }

    /// Reject setups that cannot work. Called on every load.
    pub fn validate(&self) -> Result<()> {
        if self.queue.poll_interval_ms == 0 {
            return Err(MemoraError::Configuration(
                "queue.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_pending == 0 {
            return Err(MemoraError::Configuration(
                "queue.max_pending must be greater than zero".to_string(),
            ));
        }
        if self.cache.capacity == 0 {
            return Err(MemoraError::Configuration(
                "cache.capacity must be greater than zero".to_string(),
            ));
        }
        if self.recall.max_memories == 0 {
            return Err(MemoraError::Configuration(
                "recall.max_memories must be greater than zero".to_string(),
            ));
        }
        if self.recall.half_life_hours <= 0.0 || !self.recall.half_life_hours.is_finite() {
            return Err(MemoraError::Configuration(
                "recall.half_life_hours must be a positive number".to_string(),
            ));
        }
        self.recall.weights.validate()?;

        for (name, rule) in &self.retention {
            name.parse::<MemoryType>().map_err(|_| {
                MemoraError::Configuration(format!("Unknown memory type in [retention]: {name}"))
            })?;
            rule.validate(name)?;
        }

        Ok(())
    }

    /// Directory holding the ingestion queue
    pub fn queue_dir(&self) -> PathBuf {
        self.queue
            .dir
            .clone()
            .unwrap_or_else(|| self.storage.data_dir.join("queue"))
    }

    /// Path of the SQLite database file
    pub fn db_path(&self) -> PathBuf {
        self.storage.data_dir.join(&self.storage.db_file)
    }
}

/// Which storage backend to open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// SQLite database file under the data directory
    #[default]
    Sqlite,
    /// Process-local maps, nothing persisted
    Memory,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Storage backend
    #[serde(default)]
    pub backend: BackendKind,
    /// Base directory for all persisted data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Database file name inside `data_dir`
    #[serde(default = "default_db_file")]
    pub db_file: String,
    /// How long a writer waits on a locked database before giving up
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            data_dir: default_data_dir(),
            db_file: default_db_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".memora"))
        .unwrap_or_else(|| PathBuf::from(".memora"))
}

fn default_db_file() -> String {
    "memora.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

/// Ingestion queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Queue directory (defaults to `<data_dir>/queue`)
    #[serde(default)]
    pub dir: Option<PathBuf>,
    /// How often the processor wakes to drain pending units
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Pending depth above which the processor warns
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Upper bound on a single classifier call
    #[serde(default = "default_classifier_timeout_ms")]
    pub classifier_timeout_ms: u64,
    /// How often the processor sweeps expired memories (0 disables)
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn classifier_timeout(&self) -> Duration {
        Duration::from_millis(self.classifier_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dir: None,
            poll_interval_ms: default_poll_interval_ms(),
            max_pending: default_max_pending(),
            classifier_timeout_ms: default_classifier_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_pending() -> usize {
    1000
}

fn default_classifier_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_secs() -> u64 {
    300
}

/// Recall cache configuration
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of cached lookups
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
    /// Freshness window for free-text query entries
    #[serde(default = "default_query_ttl_secs")]
    pub query_ttl_secs: u64,
    /// Freshness window for entity entries (also invalidated on write)
    #[serde(default = "default_entity_ttl_secs")]
    pub entity_ttl_secs: u64,
}

impl CacheConfig {
    pub fn query_ttl(&self) -> Duration {
        Duration::from_secs(self.query_ttl_secs)
    }

    pub fn entity_ttl(&self) -> Duration {
        Duration::from_secs(self.entity_ttl_secs)
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            query_ttl_secs: default_query_ttl_secs(),
            entity_ttl_secs: default_entity_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> usize {
    1000
}

fn default_query_ttl_secs() -> u64 {
    5
}

fn default_entity_ttl_secs() -> u64 {
    300
}

/// Recall ranking and latency configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RecallConfig {
    /// Default number of memories returned per recall
    #[serde(default = "default_max_memories")]
    pub max_memories: usize,
    /// Latency target; overruns are logged, never fatal
    #[serde(default = "default_latency_budget_ms")]
    pub latency_budget_ms: u64,
    /// Default caller timeout when none is supplied
    #[serde(default = "default_recall_timeout_ms")]
    pub timeout_ms: u64,
    /// Recency half-life used by the ranking decay
    #[serde(default = "default_half_life_hours")]
    pub half_life_hours: f64,
    /// Score component weights
    #[serde(default)]
    pub weights: RankingWeights,
}

impl RecallConfig {
    pub fn latency_budget(&self) -> Duration {
        Duration::from_millis(self.latency_budget_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            max_memories: default_max_memories(),
            latency_budget_ms: default_latency_budget_ms(),
            timeout_ms: default_recall_timeout_ms(),
            half_life_hours: default_half_life_hours(),
            weights: RankingWeights::default(),
        }
    }
}

fn default_max_memories() -> usize {
    10
}

fn default_latency_budget_ms() -> u64 {
    100
}

fn default_recall_timeout_ms() -> u64 {
    500
}

fn default_half_life_hours() -> f64 {
    168.0
}

/// Weights of the ranking score components
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct RankingWeights {
    #[serde(default = "default_importance_weight")]
    pub importance: f32,
    #[serde(default = "default_confidence_weight")]
    pub confidence: f32,
    #[serde(default = "default_recency_weight")]
    pub recency: f32,
    #[serde(default = "default_relevance_weight")]
    pub relevance: f32,
}

impl RankingWeights {
    fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("importance", self.importance),
            ("confidence", self.confidence),
            ("recency", self.recency),
            ("relevance", self.relevance),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(MemoraError::Configuration(format!(
                    "recall.weights.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for RankingWeights {
    fn default() -> Self {
        Self {
            importance: default_importance_weight(),
            confidence: default_confidence_weight(),
            recency: default_recency_weight(),
            relevance: default_relevance_weight(),
        }
    }
}

fn default_importance_weight() -> f32 {
    0.45
}

fn default_confidence_weight() -> f32 {
    0.25
}

fn default_recency_weight() -> f32 {
    0.2
}

fn default_relevance_weight() -> f32 {
    0.1
}

/// Honor keys renamed in earlier releases. The file itself is rewritten by
/// the 1.2.0 migration on the next store open.
fn apply_legacy_keys(table: &mut toml::Table) {
    let Some(queue) = table.get_mut("queue").and_then(|q| q.as_table_mut()) else {
        return;
    };
    let Some(interval) = queue.remove("interval_ms") else {
        return;
    };

    if queue.contains_key("poll_interval_ms") {
        tracing::warn!("Ignoring legacy queue.interval_ms, queue.poll_interval_ms is set");
    } else {
        tracing::warn!("queue.interval_ms is deprecated, reading it as queue.poll_interval_ms");
        queue.insert("poll_interval_ms".to_string(), interval);
    }
}

/// Longest accepted retention override: 100 years
pub const MAX_TTL_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Per-type retention override
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
pub struct RetentionOverride {
    /// Time-to-live in seconds; 0 means the type never expires
    #[serde(default)]
    pub ttl_secs: Option<i64>,
    /// Default importance for new memories of this type
    #[serde(default)]
    pub importance: Option<f32>,
}

impl RetentionOverride {
    fn validate(&self, name: &str) -> Result<()> {
        if let Some(ttl) = self.ttl_secs {
            if ttl < 0 {
                return Err(MemoraError::Configuration(format!(
                    "retention.{name}.ttl_secs cannot be negative, got {ttl}"
                )));
            }
            if ttl > MAX_TTL_SECS {
                return Err(MemoraError::Configuration(format!(
                    "retention.{name}.ttl_secs cannot exceed {MAX_TTL_SECS}, got {ttl}; \
                     use 0 for no expiry"
                )));
            }
        }
        if let Some(importance) = self.importance {
            if !(0.0..=1.0).contains(&importance) {
                return Err(MemoraError::Configuration(format!(
                    "retention.{name}.importance must be within [0, 1], got {importance}"
                )));
            }
        }
        Ok(())
    }
}
