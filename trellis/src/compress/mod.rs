//! Context compression: compaction of old turns into a summary, with a
//! memory-flush opportunity beforehand.
//!
//! Compaction triggers when the session's accumulated token estimate crosses
//! `context_window − reserve_floor − soft_threshold`. It runs a bounded
//! summarization mini-loop against the provider (restricted tool set, hard
//! wall-clock), produces a summary string, and truncates older messages
//! while preserving the system message and the most recent `keep_recent`
//! turns. A single memory-flush opportunity per cycle lets the model
//! persist durable memories through a restricted read/write/exec tool set
//! under a short deadline.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::llm::{ChatOptions, ChatRequest, LlmClient, LlmError};
use crate::message::{Message, Role};
use crate::session::Session;
use crate::tools::{CallContext, ToolRegistry};

/// Compaction tuning carried per agent.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct CompactionConfig {
    /// Model context window in tokens.
    pub context_window: u32,
    /// Tokens reserved for generation; never summarized away.
    pub reserve_floor: u32,
    /// Trigger margin below the window − reserve line.
    pub soft_threshold: u32,
    /// Most recent turns preserved verbatim through compaction.
    pub keep_recent: usize,
    /// Wall-clock budget for the summarization mini-loop.
    #[serde(with = "duration_ms")]
    pub deadline: Duration,
    /// Wall-clock budget for the pre-compaction memory flush.
    #[serde(with = "duration_ms")]
    pub flush_deadline: Duration,
    /// Whether the memory-flush opportunity runs at all.
    pub memory_flush: bool,
}

mod duration_ms {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window: 128_000,
            reserve_floor: 4096,
            soft_threshold: 8192,
            keep_recent: 12,
            deadline: Duration::from_secs(60),
            flush_deadline: Duration::from_secs(20),
            memory_flush: true,
        }
    }
}

impl CompactionConfig {
    /// Token level at which compaction triggers.
    pub fn trigger_tokens(&self) -> u32 {
        self.context_window
            .saturating_sub(self.reserve_floor)
            .saturating_sub(self.soft_threshold)
    }

    /// Whether `accumulated` is over the trigger line.
    pub fn should_compact(&self, accumulated: u32) -> bool {
        accumulated >= self.trigger_tokens()
    }
}

#[derive(Error, Debug)]
pub enum CompactError {
    #[error("summarization failed: {0}")]
    Summarize(#[from] LlmError),
    #[error("compaction deadline exceeded")]
    Deadline,
    #[error("context still exceeds window after compaction")]
    StillOverBudget,
}

const SUMMARY_PROMPT: &str = "Summarize the conversation so far for your own future reference. \
Capture open tasks, decisions, user preferences, and any facts you will need later. \
Reply with the summary text only.";

const FLUSH_PROMPT: &str = "Context is about to be condensed. If there is anything durable worth \
keeping (facts about the user, project state, decisions), persist it now using the available \
tools, then reply DONE. If nothing needs saving, reply DONE immediately.";

/// Tools available during the memory-flush window.
const FLUSH_TOOLS: &[&str] = &["read", "write", "exec"];

/// Maximum think/act iterations of the flush mini-loop.
const FLUSH_MAX_ITERATIONS: usize = 4;

/// Runs the pre-compaction memory flush: a short, tool-restricted loop that
/// lets the model persist durable memories before older turns disappear.
/// Failures and deadline hits are logged and swallowed; the flush must never
/// fail the surrounding run.
pub async fn memory_flush(
    session: &Session,
    llm: &dyn LlmClient,
    registry: &ToolRegistry,
    ctx: &CallContext,
    model: &str,
    config: &CompactionConfig,
) {
    if !config.memory_flush {
        return;
    }
    let result = tokio::time::timeout(
        config.flush_deadline,
        flush_loop(session, llm, registry, ctx, model),
    )
    .await;
    match result {
        Ok(Ok(iterations)) => tracing::debug!(iterations, "memory flush completed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "memory flush failed; continuing to compaction"),
        Err(_) => tracing::warn!("memory flush hit deadline; continuing to compaction"),
    }
}

async fn flush_loop(
    session: &Session,
    llm: &dyn LlmClient,
    registry: &ToolRegistry,
    ctx: &CallContext,
    model: &str,
) -> Result<usize, LlmError> {
    let flush_tools: Vec<String> = FLUSH_TOOLS
        .iter()
        .map(|s| s.to_string())
        .filter(|n| registry.contains(n))
        .collect();

    let mut messages = session.messages.clone();
    messages.push(Message::user(FLUSH_PROMPT));

    for iteration in 1..=FLUSH_MAX_ITERATIONS {
        let response = llm
            .chat(ChatRequest {
                messages: messages.clone(),
                tools: registry.provider_defs(&flush_tools),
                model: model.to_string(),
                options: ChatOptions {
                    temperature: Some(0.2),
                    max_tokens: None,
                },
            })
            .await?;
        if response.tool_calls.is_empty() {
            return Ok(iteration);
        }
        messages.push(Message::assistant_with_calls(
            response.content.clone(),
            response.tool_calls.clone(),
        ));
        for call in &response.tool_calls {
            let out = registry.execute(&call.name, &call.arguments, ctx).await;
            messages.push(Message::tool(call.id.clone(), out.text));
        }
    }
    Ok(FLUSH_MAX_ITERATIONS)
}

/// Compacts `session` in place: summarizes everything older than the most
/// recent `keep_recent` turns and truncates the log to
/// `[system, summary-bearing recent turns...]`. The caller re-renders the
/// system message afterwards so the new summary lands in it.
pub async fn compact_session(
    session: &mut Session,
    llm: &dyn LlmClient,
    model: &str,
    config: &CompactionConfig,
    cancel: &CancellationToken,
) -> Result<(), CompactError> {
    let summary = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CompactError::Summarize(LlmError::Cancelled)),
        r = tokio::time::timeout(config.deadline, summarize(session, llm, model, config)) => {
            match r {
                Ok(inner) => inner?,
                Err(_) => return Err(CompactError::Deadline),
            }
        }
    };

    let keep_from = cut_index(&session.messages, config.keep_recent);
    let mut kept: Vec<Message> = Vec::with_capacity(session.messages.len() - keep_from + 1);
    if let Some(first) = session.messages.first() {
        if first.role == Role::System {
            kept.push(first.clone());
        }
    }
    kept.extend_from_slice(&session.messages[keep_from..]);

    let before = session.tokens.accumulated;
    session.messages = kept;
    session.summary = Some(summary);
    session.recount_tokens();

    if session.tokens.accumulated >= before && before > 0 {
        return Err(CompactError::StillOverBudget);
    }
    Ok(())
}

/// Index of the first message to keep verbatim: `keep_recent` turns from the
/// end, never the leading system message, and never starting on a tool
/// message whose assistant anchor was cut away.
fn cut_index(messages: &[Message], keep_recent: usize) -> usize {
    let len = messages.len();
    let mut idx = len.saturating_sub(keep_recent).max(1);
    while idx < len && messages[idx].role == Role::Tool {
        idx += 1;
    }
    idx.min(len)
}

async fn summarize(
    session: &Session,
    llm: &dyn LlmClient,
    model: &str,
    config: &CompactionConfig,
) -> Result<String, CompactError> {
    let keep_from = cut_index(&session.messages, config.keep_recent);
    let mut messages: Vec<Message> = Vec::new();
    if let Some(prior) = &session.summary {
        messages.push(Message::system(format!(
            "Previous summary of this conversation:\n{}",
            prior
        )));
    }
    // Only the turns about to be dropped go to the summarizer.
    for m in &session.messages[..keep_from] {
        if m.role == Role::System {
            continue;
        }
        messages.push(m.clone());
    }
    messages.push(Message::user(SUMMARY_PROMPT));

    let response = llm
        .chat(ChatRequest {
            messages,
            tools: Vec::new(),
            model: model.to_string(),
            options: ChatOptions {
                temperature: Some(0.2),
                max_tokens: Some(1024),
            },
        })
        .await
        .map_err(CompactError::Summarize)?;
    Ok(response.content)
}
