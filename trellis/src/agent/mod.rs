//! The agent execution core: one think/act/observe traversal per run.

mod prompt;
mod runner;
mod sanitize;

pub use prompt::{build_system_prompt, PromptInputs, PromptMode};
pub use runner::AgentRunner;
pub use sanitize::{sanitize_log, OUTPUT_TRUNCATED_MARKER};

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::PeerKind;
use crate::compress::CompactError;
use crate::llm::{LlmError, MessageChunk};
use crate::session::SessionKey;
use crate::store::StoreError;
use crate::trace::TraceContext;

/// Callback draining follow-up turns merged into an in-flight run.
pub type FollowupSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

/// The loop as a callable, injected into the subagent and delegate managers
/// so they can trigger runs without the loop ever importing them.
pub type AgentRunFunc = Arc<
    dyn Fn(RunRequest) -> futures::future::BoxFuture<'static, Result<RunResult, RunError>>
        + Send
        + Sync,
>;

/// One request to drive a session to a final assistant message.
pub struct RunRequest {
    pub session_key: SessionKey,
    /// User-visible message text for this turn.
    pub content: String,
    pub user_id: String,
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: PeerKind,
    pub run_id: String,
    /// When set, incremental content fragments are forwarded here before
    /// tool execution.
    pub stream: Option<mpsc::Sender<MessageChunk>>,
    /// Extra system-prompt fragment (delegation contract, steer notes).
    pub extra_system: Option<String>,
    pub prompt_mode: PromptMode,
    pub cancel: CancellationToken,
    pub trace: TraceContext,
    /// Subagent depth; 0 for top-level runs.
    pub depth: u32,
    pub model_override: Option<String>,
    pub temperature: Option<f32>,
    pub max_iterations: Option<usize>,
    /// Drained between iterations; each entry becomes a user turn.
    pub followups: Option<FollowupSource>,
}

impl RunRequest {
    /// A request with everything derived from the session key; tests and
    /// internal callers override what they need.
    pub fn new(session_key: SessionKey, content: impl Into<String>, user_id: &str) -> Self {
        Self {
            channel: session_key.channel.clone(),
            chat_id: session_key.peer_id.clone(),
            peer_kind: session_key.peer_kind,
            session_key,
            content: content.into(),
            user_id: user_id.to_string(),
            run_id: uuid::Uuid::new_v4().to_string(),
            stream: None,
            extra_system: None,
            prompt_mode: PromptMode::Full,
            cancel: CancellationToken::new(),
            trace: TraceContext::new_root(),
            depth: 0,
            model_override: None,
            temperature: None,
            max_iterations: None,
            followups: None,
        }
    }
}

/// Final outcome of a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunResult {
    /// The final assistant content.
    pub content: String,
    /// Provider round-trips taken.
    pub iterations: usize,
}

#[derive(Error, Debug)]
pub enum RunError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),
    #[error(transparent)]
    Provider(LlmError),
    #[error(transparent)]
    Compaction(#[from] CompactError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("context window exhausted after compaction")]
    ContextOverflow,
    #[error("run cancelled")]
    Cancelled,
}

impl From<LlmError> for RunError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::Cancelled => RunError::Cancelled,
            other => RunError::Provider(other),
        }
    }
}

impl RunError {
    /// Cancellation is a clean exit, not a failure to report to the user.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, RunError::Cancelled)
    }
}
