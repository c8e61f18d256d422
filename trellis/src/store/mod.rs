//! Store traits the core consumes, with in-memory implementations for tests
//! and single-node deployments. Variant behavior is encoded by the set of
//! capabilities a trait exposes, never by runtime type checks.

mod agent;
mod cron;
mod memory;
mod skills;
mod team;

pub use agent::{
    AgentConfig, AgentLinkStore, AgentRecord, AgentStore, AgentType, AgentLink, InMemoryAgentStore,
    InMemoryAgentLinkStore, LinkDirection, LinkSettings, LinkStatus, PruneConfig, SubagentLimits,
    DEFAULT_MAX_DELEGATION_LOAD,
};
pub use cron::{CronJob, CronStore, InMemoryCronStore};
pub use memory::{
    chunk_markdown, cosine_similarity, Embedder, HashEmbedder, InMemoryMemoryStore, MemoryRecord,
    MemoryScope, MemorySearchHit, MemoryStore, OpenAiEmbedder,
};
pub use skills::{InMemorySkillStore, Skill, SkillStore};
pub use team::{InMemoryTeamTaskStore, TaskState, TeamTaskStore};

use thiserror::Error;

/// Error surface shared by every store trait.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("embedding error: {0}")]
    Embedding(String),
    #[error("conflict: {0}")]
    Conflict(String),
}
