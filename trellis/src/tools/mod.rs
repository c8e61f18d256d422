//! Tools: the named, schema-described operations the LLM can invoke.
//!
//! Each tool declares a stable name, a JSON-Schema parameter descriptor, and
//! an async `call`. Tools hold only construction-time dependencies; every
//! per-call value (channel, chat id, peer kind, sandbox key, notify
//! callback) flows through [`CallContext`], so one tool instance can serve
//! concurrent calls safely.
//!
//! The [`ToolRegistry`] wraps every call in the execution pipeline: rate
//! limiting by session key, credential scrubbing, duration recording, and a
//! tool span. Errors never escape as exceptions to the LLM; they become
//! text results with `is_error` set.

mod policy;
mod ratelimit;
mod registry;
mod scrub;

pub mod builtin;

pub use policy::{ToolPolicy, ToolProfile, PolicyQuery, resolve_allowed_tools, ALWAYS_DENIED_FOR_SUBAGENTS, SPAWN_FAMILY};
pub use ratelimit::{RateLimitConfig, SessionRateLimiter};
pub use registry::ToolRegistry;
pub use scrub::scrub_credentials;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::bus::PeerKind;
use crate::trace::TraceContext;

/// Specification of one tool: name, description for the LLM, JSON Schema.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: serde_json::Value,
}

/// Provider-transport shape of a tool definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

impl From<ToolSpec> for ToolDef {
    fn from(spec: ToolSpec) -> Self {
        Self {
            name: spec.name,
            description: spec.description,
            parameters: spec.input_schema,
        }
    }
}

/// What a tool call produced: text for the LLM, optional text for the user,
/// and whether this is an error result.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub user_text: Option<String>,
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_text: None,
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            user_text: None,
            is_error: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("execution failed: {0}")]
    Execution(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("denied: {0}")]
    Denied(String),
}

/// Per-call context injected by the registry before execution.
///
/// Tools read these instead of storing them on instance state, permitting
/// safe sharing across tasks.
#[derive(Clone)]
pub struct CallContext {
    /// Rendered session key of the calling run.
    pub session_key: String,
    pub agent_id: String,
    pub user_id: String,
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    /// Isolation key for exec-style tools.
    pub sandbox_key: Option<String>,
    /// Workspace root for file tools.
    pub workspace: PathBuf,
    /// Subagent depth of the calling run; 0 for top-level runs.
    pub depth: u32,
    pub trace: TraceContext,
    pub cancel: CancellationToken,
    /// Callback for tools that produce out-of-band user-visible output
    /// (progress notes, async acknowledgements).
    pub notify: Option<Arc<dyn Fn(String) + Send + Sync>>,
}

impl CallContext {
    /// Minimal context for tests.
    pub fn test(session_key: &str) -> Self {
        Self {
            session_key: session_key.to_string(),
            agent_id: "agent-test".into(),
            user_id: "user-test".into(),
            channel: "test".into(),
            chat_id: "chat-test".into(),
            peer_kind: PeerKind::Direct,
            sandbox_key: None,
            workspace: std::env::temp_dir(),
            depth: 0,
            trace: TraceContext::new_root(),
            cancel: CancellationToken::new(),
            notify: None,
        }
    }
}

/// A single callable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable unique name.
    fn name(&self) -> &str;

    /// Name, description, and JSON Schema for the provider.
    fn spec(&self) -> ToolSpec;

    /// Executes with parsed JSON arguments and the per-call context.
    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError>;
}
