//! Recall cache
//!
//! Bounded LRU of ranked recall results, keyed by entity name or by
//! canonical query text. Entity entries are dropped synchronously when a
//! write mentions the entity; every entry also ages out after a freshness
//! window so expiry is eventually reflected.
//!
//! Every invalidation bumps a generation counter. A result computed from a
//! read that started before an invalidation is returned to its caller but
//! never written back.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use lru::LruCache;

use crate::config::CacheConfig;
use crate::memory::types::Entity;
use crate::recall::ranking::RankedMemory;

/// Default capacity for the recall cache
pub const DEFAULT_CACHE_CAPACITY: usize = 1000;

/// What a cached result was computed for
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    /// Lowercased entity name
    Entity(String),
    /// Canonical free-text query
    Query(String),
}

impl CacheKey {
    pub fn entity(name: &str) -> Self {
        CacheKey::Entity(Entity::key(name))
    }

    pub fn query(text: &str) -> Self {
        CacheKey::Query(canonicalize_query(text))
    }
}

/// Lowercase, strip punctuation and collapse whitespace
pub fn canonicalize_query(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug)]
struct CachedRecall {
    memories: Arc<Vec<RankedMemory>>,
    computed_at: Instant,
}

impl CachedRecall {
    fn new(memories: Arc<Vec<RankedMemory>>) -> Self {
        Self {
            memories,
            computed_at: Instant::now(),
        }
    }
}

/// Shared LRU cache in front of the store
#[derive(Debug)]
pub struct RecallCache {
    entries: Mutex<LruCache<CacheKey, CachedRecall>>,
    generation: AtomicU64,
    query_ttl: Duration,
    entity_ttl: Duration,
}

impl RecallCache {
    /// Creates a cache holding at most `capacity` results.
    ///
    /// A zero capacity falls back to [`DEFAULT_CACHE_CAPACITY`].
    pub fn new(capacity: usize, query_ttl: Duration, entity_ttl: Duration) -> Self {
        let cap = NonZeroUsize::new(capacity)
            .or(NonZeroUsize::new(DEFAULT_CACHE_CAPACITY))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(cap)),
            generation: AtomicU64::new(0),
            query_ttl,
            entity_ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.capacity, config.query_ttl(), config.entity_ttl())
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, CachedRecall>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ttl_for(&self, key: &CacheKey) -> Duration {
        match key {
            CacheKey::Entity(_) => self.entity_ttl,
            CacheKey::Query(_) => self.query_ttl,
        }
    }

    /// Fresh cached result for `key`. Stale entries are evicted on lookup.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<RankedMemory>>> {
        let ttl = self.ttl_for(key);
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.computed_at.elapsed() <= ttl => {
                return Some(Arc::clone(&entry.memories));
            }
            Some(_) => {}
            None => return None,
        }
        entries.pop(key);
        None
    }

    /// Current invalidation generation. Capture it before reading the store
    /// and hand it to [`insert_if_current`](Self::insert_if_current).
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Store a freshly computed result
    pub fn insert(&self, key: CacheKey, memories: Vec<RankedMemory>) -> Arc<Vec<RankedMemory>> {
        let memories = Arc::new(memories);
        self.lock().put(key, CachedRecall::new(Arc::clone(&memories)));
        memories
    }

    /// Store `memories` only if nothing was invalidated since `generation`
    /// was read. The result is returned either way.
    pub fn insert_if_current(
        &self,
        key: CacheKey,
        memories: Vec<RankedMemory>,
        generation: u64,
    ) -> Arc<Vec<RankedMemory>> {
        let memories = Arc::new(memories);
        let mut entries = self.lock();
        if self.generation.load(Ordering::Acquire) == generation {
            entries.put(key, CachedRecall::new(Arc::clone(&memories)));
        } else {
            tracing::debug!("Skipping cache write for {:?}: invalidated mid-read", key);
        }
        memories
    }

    /// Drop the cached lookup for one entity. Returns true if one existed.
    pub fn invalidate_entity(&self, name: &str) -> bool {
        let mut entries = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.pop(&CacheKey::entity(name)).is_some()
    }

    /// Drop every cached result
    pub fn clear(&self) {
        let mut entries = self.lock();
        self.generation.fetch_add(1, Ordering::AcqRel);
        entries.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }
}

impl Default for RecallCache {
    fn default() -> Self {
        Self::from_config(&CacheConfig::default())
    }
}
