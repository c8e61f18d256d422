//! Capped exponential backoff for transient provider errors.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ChatRequest, ChatResponse, LlmClient, LlmError, MessageChunk};
use tokio::sync::mpsc;

/// Retry budget for one provider call.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        exp.min(self.max_delay)
    }
}

/// Calls the provider, retrying transient failures with capped exponential
/// backoff. Fatal errors and cancellation return immediately; once the
/// budget is exhausted the last transient error is surfaced as-is.
pub async fn retry_chat(
    llm: &dyn LlmClient,
    req: ChatRequest,
    chunk_tx: Option<mpsc::Sender<MessageChunk>>,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<ChatResponse, LlmError> {
    let mut last_err = None;
    for attempt in 0..policy.max_attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }
        let result = tokio::select! {
            r = llm.chat_stream(req.clone(), chunk_tx.clone()) => r,
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(err) if err.is_transient() => {
                let delay = policy.delay_for(attempt);
                tracing::warn!(attempt, ?delay, error = %err, "transient provider error; backing off");
                last_err = Some(err);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or_else(|| LlmError::Fatal("retry budget exhausted".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;

    #[tokio::test]
    async fn transient_error_is_retried() {
        let llm = ScriptedLlm::text("ok");
        llm.fail_next(LlmError::Transient("reset".into()));
        let policy = RetryPolicy {
            base_delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let cancel = CancellationToken::new();
        let resp = retry_chat(&llm, ChatRequest::default(), None, policy, &cancel)
            .await
            .unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let llm = ScriptedLlm::text("ok");
        llm.fail_next(LlmError::Fatal("schema".into()));
        let cancel = CancellationToken::new();
        let err = retry_chat(
            &llm,
            ChatRequest::default(),
            None,
            RetryPolicy::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Fatal(_)));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let llm = ScriptedLlm::text("ok");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = retry_chat(
            &llm,
            ChatRequest::default(),
            None,
            RetryPolicy::default(),
            &cancel,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LlmError::Cancelled));
        assert_eq!(llm.call_count(), 0);
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(5), Duration::from_secs(4));
    }
}
