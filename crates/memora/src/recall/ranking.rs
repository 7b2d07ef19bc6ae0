//! Ranking for recall
//!
//! Scores candidates by importance, confidence, recency and keyword
//! relevance, then orders them deterministically:
//! 1. Final score, highest first
//! 2. Most recent `created_at`
//! 3. Memory id

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::config::{RankingWeights, RecallConfig};
use crate::memory::types::{Entity, Memory};

/// Scores are rounded to this many places so float noise never beats the
/// created_at tie-break.
const SCORE_DECIMAL_PLACES: u8 = 4;

/// A memory with its recall score
#[derive(Debug, Clone, PartialEq)]
pub struct RankedMemory {
    /// The ranked memory
    pub memory: Memory,
    /// Final combined score
    pub score: f32,
}

/// Configurable scoring function
#[derive(Debug, Clone)]
pub struct Ranker {
    weights: RankingWeights,
    half_life_hours: f64,
}

impl Default for Ranker {
    fn default() -> Self {
        Self::from_config(&RecallConfig::default())
    }
}

impl Ranker {
    pub fn new(weights: RankingWeights, half_life_hours: f64) -> Self {
        Self {
            weights,
            half_life_hours,
        }
    }

    pub fn from_config(config: &RecallConfig) -> Self {
        Self::new(config.weights, config.half_life_hours)
    }

    /// Exponential decay on time since last reinforcement: 1.0 now, 0.5
    /// after one half-life
    pub fn recency_factor(&self, memory: &Memory, now: DateTime<Utc>) -> f32 {
        let age_hours = (now - memory.updated_at).num_seconds().max(0) as f64 / 3600.0;
        let decay = (-std::f64::consts::LN_2 * age_hours / self.half_life_hours).exp();
        decay as f32
    }

    /// Final score of one memory against the query terms
    pub fn score(&self, memory: &Memory, query_terms: &[String], now: DateTime<Utc>) -> f32 {
        let w = &self.weights;
        let score = w.importance * memory.importance
            + w.confidence * memory.confidence
            + w.recency * self.recency_factor(memory, now)
            + w.relevance * keyword_overlap_score(query_terms, memory);
        quantize_score(score, SCORE_DECIMAL_PLACES)
    }

    /// Score, order and truncate candidates
    pub fn rank(
        &self,
        candidates: Vec<Memory>,
        query_terms: &[String],
        now: DateTime<Utc>,
        limit: usize,
    ) -> Vec<RankedMemory> {
        let mut ranked: Vec<RankedMemory> = candidates
            .into_iter()
            .map(|memory| RankedMemory {
                score: self.score(&memory, query_terms, now),
                memory,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.memory.created_at.cmp(&a.memory.created_at))
                .then_with(|| a.memory.id.cmp(&b.memory.id))
        });
        ranked.truncate(limit);
        ranked
    }
}

/// Fraction of query terms found in the memory's words or entity names
pub fn keyword_overlap_score(query_terms: &[String], memory: &Memory) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let mut vocabulary: HashSet<String> = memory
        .content
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    vocabulary.extend(memory.entities.iter().map(|e| Entity::key(&e.name)));

    let matches = query_terms
        .iter()
        .filter(|t| vocabulary.contains(&t.to_lowercase()))
        .count();
    matches as f32 / query_terms.len() as f32
}

fn quantize_score(score: f32, decimal_places: u8) -> f32 {
    let multiplier = 10_f32.powi(decimal_places as i32);
    (score * multiplier).round() / multiplier
}
