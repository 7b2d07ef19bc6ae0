//! Retention policy: default importance and time-to-live per memory type.
//!
//! A memory's expiry is decided once, at creation, from its type. Later
//! re-ingestion slides the window forward but never changes the class.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::config::{MAX_TTL_SECS, RetentionOverride};
use crate::error::{MemoraError, Result};
use crate::memory::types::{Memory, MemoryType};

/// Retention class of a single memory type
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionRule {
    /// Default importance for new memories of this type
    pub importance: f32,
    /// Lifetime after creation; `None` never expires
    pub ttl: Option<Duration>,
}

impl RetentionRule {
    const fn new(importance: f32, ttl: Option<Duration>) -> Self {
        Self { importance, ttl }
    }
}

/// Maps every memory type to its retention class
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    rules: HashMap<MemoryType, RetentionRule>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        let rules = MemoryType::ALL
            .into_iter()
            .map(|memory_type| (memory_type, default_rule(memory_type)))
            .collect();
        Self { rules }
    }
}

fn default_rule(memory_type: MemoryType) -> RetentionRule {
    match memory_type {
        MemoryType::Identity => RetentionRule::new(0.9, None),
        MemoryType::Preference => RetentionRule::new(0.8, None),
        MemoryType::Decision => RetentionRule::new(0.8, Some(Duration::days(90))),
        MemoryType::Solution => RetentionRule::new(0.7, Some(Duration::days(60))),
        MemoryType::Pattern => RetentionRule::new(0.6, Some(Duration::days(30))),
        MemoryType::Context => RetentionRule::new(0.5, Some(Duration::days(1))),
        MemoryType::Status => RetentionRule::new(0.4, Some(Duration::hours(6))),
    }
}

impl RetentionPolicy {
    /// Build a policy from the `[retention]` config table.
    ///
    /// Unknown type names and out-of-range values are configuration errors.
    pub fn from_config(overrides: &HashMap<String, RetentionOverride>) -> Result<Self> {
        let mut policy = Self::default();

        for (name, rule) in overrides {
            let memory_type: MemoryType = name.parse().map_err(|_| {
                MemoraError::Configuration(format!("Unknown memory type in [retention]: {name}"))
            })?;
            let entry = policy
                .rules
                .get_mut(&memory_type)
                .ok_or_else(|| MemoraError::Configuration(format!("No rule for {memory_type}")))?;

            if let Some(ttl_secs) = rule.ttl_secs {
                entry.ttl = match ttl_secs {
                    0 => None,
                    secs if (1..=MAX_TTL_SECS).contains(&secs) => Duration::try_seconds(secs),
                    secs => {
                        return Err(MemoraError::Configuration(format!(
                            "retention.{name}.ttl_secs must be within [0, {MAX_TTL_SECS}], \
                             got {secs}"
                        )));
                    }
                };
            }
            if let Some(importance) = rule.importance {
                if !(0.0..=1.0).contains(&importance) {
                    return Err(MemoraError::Configuration(format!(
                        "retention.{name}.importance must be within [0, 1], got {importance}"
                    )));
                }
                entry.importance = importance;
            }

            tracing::debug!(
                "Retention override for {}: importance={}, ttl={:?}",
                memory_type,
                entry.importance,
                entry.ttl
            );
        }

        Ok(policy)
    }

    /// Retention class of `memory_type`
    pub fn rule(&self, memory_type: MemoryType) -> RetentionRule {
        self.rules
            .get(&memory_type)
            .copied()
            .unwrap_or_else(|| default_rule(memory_type))
    }

    /// Expiry for a memory of `memory_type` created at `created_at`.
    ///
    /// An expiry past the representable range is treated as never.
    pub fn valid_to(
        &self,
        memory_type: MemoryType,
        created_at: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        self.rule(memory_type)
            .ttl
            .and_then(|ttl| created_at.checked_add_signed(ttl))
    }

    /// Stamp default importance and expiry onto a new memory.
    ///
    /// An explicit `valid_to` already set on the memory is kept.
    pub fn apply(&self, memory: &mut Memory) {
        let rule = self.rule(memory.memory_type);
        memory.importance = rule.importance;
        if memory.valid_to.is_none() {
            memory.valid_to = self.valid_to(memory.memory_type, memory.created_at);
        }
    }
}
