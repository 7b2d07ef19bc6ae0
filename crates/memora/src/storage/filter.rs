//! Filter types for memory search operations
//!
//! Narrows keyword search by memory type, importance, creation time and
//! attribution. Both backends honor the same filter: SQLite through a
//! parameterized WHERE fragment, the in-memory backend through `matches`.

use chrono::{DateTime, Utc};
use rusqlite::types::Value;

use crate::memory::types::{Memory, MemoryType};

/// Filter criteria for memory search operations.
///
/// All fields are optional - when `None`, that filter is not applied.
/// Multiple filters are combined with AND logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryFilter {
    /// Filter by specific memory types (OR logic within this filter)
    pub memory_types: Option<Vec<MemoryType>>,
    /// Minimum importance threshold (inclusive)
    pub min_importance: Option<f32>,
    /// Only return memories created at or after this time
    pub since: Option<DateTime<Utc>>,
    /// Only return memories recorded by this agent
    pub agent_id: Option<String>,
}

impl MemoryFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter by memory types
    pub fn with_memory_types(mut self, types: Vec<MemoryType>) -> Self {
        self.memory_types = Some(types);
        self
    }

    /// Filter by minimum importance
    pub fn with_min_importance(mut self, min_importance: f32) -> Self {
        self.min_importance = Some(min_importance);
        self
    }

    /// Filter by creation time
    pub fn since(mut self, since: DateTime<Utc>) -> Self {
        self.since = Some(since);
        self
    }

    /// Filter by agent attribution
    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Build a SQL condition over the `m` alias of the memories table.
    /// Returns `None` if no filters are set.
    pub fn to_sql_clause(&self) -> Option<(String, Vec<Value>)> {
        let mut conditions = Vec::new();
        let mut params = Vec::new();

        // Memory types filter (OR within types)
        if let Some(ref types) = self.memory_types {
            if !types.is_empty() {
                let placeholders = vec!["?"; types.len()].join(", ");
                conditions.push(format!("m.memory_type IN ({placeholders})"));
                params.extend(types.iter().map(|t| Value::Text(t.as_str().to_string())));
            }
        }

        if let Some(min_importance) = self.min_importance {
            conditions.push("m.importance >= ?".to_string());
            params.push(Value::Real(f64::from(min_importance)));
        }

        // created_at is stored as microseconds since epoch
        if let Some(ref since) = self.since {
            conditions.push("m.created_at >= ?".to_string());
            params.push(Value::Integer(since.timestamp_micros()));
        }

        if let Some(ref agent_id) = self.agent_id {
            conditions.push("m.agent_id = ?".to_string());
            params.push(Value::Text(agent_id.clone()));
        }

        if conditions.is_empty() {
            None
        } else {
            Some((conditions.join(" AND "), params))
        }
    }

    /// Whether `memory` passes every set condition
    pub fn matches(&self, memory: &Memory) -> bool {
        if let Some(ref types) = self.memory_types {
            if !types.is_empty() && !types.contains(&memory.memory_type) {
                return false;
            }
        }
        if self
            .min_importance
            .is_some_and(|min| memory.importance < min)
        {
            return false;
        }
        if self.since.is_some_and(|since| memory.created_at < since) {
            return false;
        }
        if let Some(ref agent_id) = self.agent_id {
            if &memory.agent_id != agent_id {
                return false;
            }
        }
        true
    }

    /// Check if this filter is empty (no conditions set)
    pub fn is_empty(&self) -> bool {
        self.memory_types.is_none()
            && self.min_importance.is_none()
            && self.since.is_none()
            && self.agent_id.is_none()
    }
}
