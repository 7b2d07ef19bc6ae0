//! Memora - typed, expiring memory store for LLM agents
//!
//! Agents `learn` short facts and `recall` the most relevant ones later.
//! Facts are classified into a fixed set of memory types, each with its own
//! importance and lifetime, deduplicated by content hash, and ranked on
//! recall by importance, confidence, recency and keyword relevance.

pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod memory;
pub mod migration;
pub mod queue;
pub mod recall;
pub mod storage;
pub mod store;
pub mod testing;

pub use engine::{LearnAck, LearnRequest, Memora};
pub use error::MemoraError;
