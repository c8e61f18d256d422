//! LLM provider abstraction for the agent loop.
//!
//! A provider takes the full message log plus tool schemas and returns
//! assistant content with optional tool calls. Streaming is modeled by an
//! optional `Sender<MessageChunk>`: implementations that stream send token
//! fragments through the channel and still return the complete response at
//! the end, so non-streaming callers need no separate path.
//!
//! Errors are classified at this boundary: [`LlmError::Transient`] is worth
//! a retry with backoff, [`LlmError::Fatal`] is surfaced immediately.

mod mock;
mod openai;
mod retry;

pub use mock::ScriptedLlm;
pub use openai::OpenAiChat;
pub use retry::{retry_chat, RetryPolicy};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{Message, ToolCall};
use crate::tools::ToolDef;

/// One incremental content fragment from a streaming completion.
#[derive(Clone, Debug)]
pub struct MessageChunk {
    pub content: String,
}

/// Token usage for one completion.
#[derive(Clone, Copy, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct LlmUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Decoding options forwarded to the provider.
#[derive(Clone, Debug, Default)]
pub struct ChatOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One provider request: messages, tool schemas, model, options.
#[derive(Clone, Debug, Default)]
pub struct ChatRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDef>,
    pub model: String,
    pub options: ChatOptions,
}

/// Provider response: assistant content, tool calls, usage when reported.
#[derive(Clone, Debug, Default)]
pub struct ChatResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Option<LlmUsage>,
}

#[derive(Error, Debug)]
pub enum LlmError {
    /// Worth retrying: timeouts, 429s, 5xx, connection resets.
    #[error("provider transient error: {0}")]
    Transient(String),
    /// Not worth retrying: schema errors, auth failures, 4xx other than 429.
    #[error("provider fatal error: {0}")]
    Fatal(String),
    #[error("cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Transient(_))
    }
}

/// Chat provider: the only surface the agent loop needs from an LLM vendor.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// One completion over the full request.
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError>;

    /// Streaming variant. When `chunk_tx` is `Some`, implementations send
    /// content fragments as they arrive; the complete response is still
    /// returned at the end. Default implementation completes first and sends
    /// the whole content as one chunk.
    async fn chat_stream(
        &self,
        req: ChatRequest,
        chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    ) -> Result<ChatResponse, LlmError> {
        let response = self.chat(req).await?;
        if let Some(tx) = chunk_tx {
            if !response.content.is_empty() {
                let _ = tx
                    .send(MessageChunk {
                        content: response.content.clone(),
                    })
                    .await;
            }
        }
        Ok(response)
    }
}
