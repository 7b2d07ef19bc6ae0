//! Memory recall
//!
//! Two-stage lookup behind a shared LRU cache:
//! 1. Keyword search in the store for a candidate pool
//! 2. Rank candidates and keep the top `max_memories`
//!
//! Recall never fails the caller. A timeout or storage error yields an
//! empty, `degraded` result and a warning.

pub mod cache;
pub mod ranking;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, warn};

use crate::classifier::extract_entities;
use crate::config::RecallConfig;
use crate::error::{MemoraError, Result};
use crate::memory::types::Entity;
use crate::storage::MemoryFilter;
use crate::store::MemoryStore;

pub use cache::{CacheKey, DEFAULT_CACHE_CAPACITY, RecallCache, canonicalize_query};
pub use ranking::{RankedMemory, Ranker, keyword_overlap_score};

/// Candidate pool size relative to the requested count
const CANDIDATE_MULTIPLIER: usize = 3;

/// Words that carry no recall signal
const STOPWORDS: &[&str] = &[
    "a", "about", "an", "and", "are", "as", "at", "be", "by", "can", "did", "do", "does", "for",
    "from", "has", "have", "how", "i", "in", "is", "it", "me", "my", "of", "on", "or", "our",
    "so", "that", "the", "this", "to", "us", "use", "used", "was", "we", "what", "when", "where",
    "which", "who", "why", "with", "you", "your",
];

/// Outcome of one recall
#[derive(Debug, Clone, Default)]
pub struct RecallResult {
    /// Ranked memories, best first
    pub memories: Vec<RankedMemory>,
    /// Wall time spent, including cache lookup
    pub elapsed: Duration,
    /// Served from the recall cache
    pub cache_hit: bool,
    /// Lookup timed out or storage failed; `memories` is empty
    pub degraded: bool,
}

impl RecallResult {
    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }
}

/// Significant lowercase terms of a free-text query, plus canonical keys of
/// any entities it names
pub fn query_terms(query: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();

    for word in canonicalize_query(query).split_whitespace() {
        if word.chars().count() < 2 || STOPWORDS.contains(&word) {
            continue;
        }
        if seen.insert(word.to_string()) {
            terms.push(word.to_string());
        }
    }
    for entity in extract_entities(query) {
        let key = Entity::key(&entity.name);
        if seen.insert(key.clone()) {
            terms.push(key);
        }
    }
    terms
}

pub struct Recaller {
    store: Arc<MemoryStore>,
    ranker: Ranker,
    config: RecallConfig,
}

impl Recaller {
    pub fn new(store: Arc<MemoryStore>, config: RecallConfig) -> Self {
        Self {
            store,
            ranker: Ranker::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    /// Recall memories relevant to a free-text prompt
    pub async fn recall(
        &self,
        prompt: &str,
        max_memories: usize,
        timeout: Duration,
    ) -> RecallResult {
        let key = CacheKey::query(prompt);
        let terms = query_terms(prompt);
        let depth = self.depth(max_memories);
        let lookup = async {
            if terms.is_empty() {
                return Ok(Vec::new());
            }
            let candidates = self
                .store
                .search(
                    &terms,
                    &MemoryFilter::default(),
                    depth.saturating_mul(CANDIDATE_MULTIPLIER),
                )
                .await?;
            Ok(self.ranker.rank(candidates, &terms, Utc::now(), depth))
        };
        self.cached(key, max_memories, timeout, lookup).await
    }

    /// Recall memories mentioning one entity
    pub async fn recall_entity(
        &self,
        name: &str,
        max_memories: usize,
        timeout: Duration,
    ) -> RecallResult {
        let key = CacheKey::entity(name);
        let terms = vec![Entity::key(name)];
        let depth = self.depth(max_memories);
        let lookup = async {
            let candidates = self.store.get_by_entity(name).await?;
            Ok(self.ranker.rank(candidates, &terms, Utc::now(), depth))
        };
        self.cached(key, max_memories, timeout, lookup).await
    }

    /// Cached results are ranked at least `max_memories` deep so smaller
    /// requests can share them
    fn depth(&self, max_memories: usize) -> usize {
        max_memories.max(self.config.max_memories)
    }

    /// Free-text recall restricted by `filter`. Not cached.
    pub async fn recall_filtered(
        &self,
        prompt: &str,
        filter: &MemoryFilter,
        max_memories: usize,
        timeout: Duration,
    ) -> RecallResult {
        let started = Instant::now();
        let terms = query_terms(prompt);
        let lookup = async {
            if terms.is_empty() || max_memories == 0 {
                return Ok(Vec::new());
            }
            let candidates = self
                .store
                .search(&terms, filter, max_memories.saturating_mul(CANDIDATE_MULTIPLIER))
                .await?;
            Ok(self.ranker.rank(candidates, &terms, Utc::now(), max_memories))
        };

        match self.bounded(lookup, timeout).await {
            Some(memories) => self.finish(memories, started, false, false),
            None => self.finish(Vec::new(), started, false, true),
        }
    }

    async fn cached(
        &self,
        key: CacheKey,
        max_memories: usize,
        timeout: Duration,
        lookup: impl Future<Output = Result<Vec<RankedMemory>>>,
    ) -> RecallResult {
        let started = Instant::now();
        if max_memories == 0 {
            return self.finish(Vec::new(), started, false, false);
        }

        let cache = self.store.cache();
        let generation = cache.generation();
        if let Some(hit) = cache.get(&key) {
            // A short entry is complete; a long enough one covers this request
            if hit.len() >= max_memories || hit.len() < self.config.max_memories {
                let memories = hit.iter().take(max_memories).cloned().collect();
                return self.finish(memories, started, true, false);
            }
        }

        match self.bounded(lookup, timeout).await {
            Some(memories) => {
                let cached = cache.insert_if_current(key, memories, generation);
                let memories = cached.iter().take(max_memories).cloned().collect();
                self.finish(memories, started, false, false)
            }
            None => self.finish(Vec::new(), started, false, true),
        }
    }

    /// Run `lookup` under `timeout`. `None` means degraded.
    async fn bounded(
        &self,
        lookup: impl Future<Output = Result<Vec<RankedMemory>>>,
        timeout: Duration,
    ) -> Option<Vec<RankedMemory>> {
        match tokio::time::timeout(timeout, lookup).await {
            Ok(Ok(memories)) => Some(memories),
            Ok(Err(e)) => {
                warn!("Recall failed, returning no memories: {}", e);
                None
            }
            Err(_) => {
                warn!("Recall timed out after {:?}, returning no memories", timeout);
                None
            }
        }
    }

    fn finish(
        &self,
        memories: Vec<RankedMemory>,
        started: Instant,
        cache_hit: bool,
        degraded: bool,
    ) -> RecallResult {
        let elapsed = started.elapsed();
        let budget = self.config.latency_budget();
        if elapsed > budget {
            let error = MemoraError::Performance(format!(
                "recall took {}ms, budget {}ms",
                elapsed.as_millis(),
                budget.as_millis()
            ));
            warn!("{}", error);
        }
        debug!(
            "Recalled {} memories in {:?} (cache_hit={}, degraded={})",
            memories.len(),
            elapsed,
            cache_hit,
            degraded
        );
        RecallResult {
            memories,
            elapsed,
            cache_hit,
            degraded,
        }
    }
}
