//! Memory types and retention
//!
//! Defines the memory record, its type taxonomy, and the retention
//! policy that decides importance and expiry per type.

pub mod retention;
pub mod types;

pub use retention::{RetentionPolicy, RetentionRule};
pub use types::{DEFAULT_AGENT_ID, Entity, Memory, MemoryType, Metadata, content_hash};
