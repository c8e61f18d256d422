//! Context files: per-agent / per-user prompt fragments, the truncation
//! pipeline that embeds them into the system prompt, interceptors routing
//! file-tool traffic, and idempotent seeding from embedded templates.

mod files;
mod seed;
mod truncate;

pub use files::{
    is_context_file, ContextFileInterceptor, ContextFileStore, InMemoryContextFileStore,
    MemoryInterceptor, CONTEXT_FILES, MEMORY_INDEX, PERSONALIZATION_FILE,
};
pub use seed::{seed_agent_files, seed_user_files, template_for};
pub use truncate::{truncate_files, ContextBlock, TruncationConfig, TRUNCATION_MARKER};
