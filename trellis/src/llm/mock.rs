//! Scripted provider for loop tests: plays back a fixed sequence of
//! responses, one per call, and records every request it saw.

use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatRequest, ChatResponse, LlmClient, LlmError};
use crate::message::ToolCall;

/// Plays back `responses` in order; repeats the last one when exhausted.
/// Requests are recorded for assertions.
pub struct ScriptedLlm {
    responses: Mutex<Vec<ChatResponse>>,
    requests: Mutex<Vec<ChatRequest>>,
    fail_with: Mutex<Option<LlmError>>,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<ChatResponse>) -> Self {
        let mut rev = responses;
        rev.reverse();
        Self {
            responses: Mutex::new(rev),
            requests: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
        }
    }

    /// Single fixed text response.
    pub fn text(content: &str) -> Self {
        Self::new(vec![ChatResponse {
            content: content.to_string(),
            ..ChatResponse::default()
        }])
    }

    /// First response requests `calls`, second is the final `content`.
    pub fn tool_round(calls: Vec<ToolCall>, content: &str) -> Self {
        Self::new(vec![
            ChatResponse {
                content: String::new(),
                tool_calls: calls,
                ..ChatResponse::default()
            },
            ChatResponse {
                content: content.to_string(),
                ..ChatResponse::default()
            },
        ])
    }

    /// Makes every subsequent call fail with `err`.
    pub fn fail_next(&self, err: LlmError) {
        *self.fail_with.lock().unwrap() = Some(err);
    }

    /// Requests observed so far, oldest first.
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.requests.lock().unwrap().push(req);
        if let Some(err) = self.fail_with.lock().unwrap().take() {
            return Err(err);
        }
        let mut responses = self.responses.lock().unwrap();
        match responses.len() {
            0 => Ok(ChatResponse::default()),
            1 => Ok(responses[0].clone()),
            _ => Ok(responses.pop().expect("len checked")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn plays_back_in_order_and_repeats_last() {
        let llm = ScriptedLlm::new(vec![
            ChatResponse {
                content: "one".into(),
                ..ChatResponse::default()
            },
            ChatResponse {
                content: "two".into(),
                ..ChatResponse::default()
            },
        ]);
        assert_eq!(llm.chat(ChatRequest::default()).await.unwrap().content, "one");
        assert_eq!(llm.chat(ChatRequest::default()).await.unwrap().content, "two");
        assert_eq!(llm.chat(ChatRequest::default()).await.unwrap().content, "two");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn fail_next_fails_once() {
        let llm = ScriptedLlm::text("ok");
        llm.fail_next(LlmError::Transient("boom".into()));
        assert!(llm.chat(ChatRequest::default()).await.is_err());
        assert_eq!(llm.chat(ChatRequest::default()).await.unwrap().content, "ok");
    }
}
