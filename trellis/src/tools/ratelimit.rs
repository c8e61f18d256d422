//! Per-session-key tool rate limiting.
//!
//! A fixed window per session key: at most `max_calls` within `window`.
//! Exceeding the limit is not an error at the registry boundary; the call
//! becomes an `is_error` tool result so the LLM can adapt.

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    pub max_calls: u32,
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_calls: 30,
            window: Duration::from_secs(60),
        }
    }
}

/// Sliding-window counter per session key.
pub struct SessionRateLimiter {
    config: RateLimitConfig,
    calls: DashMap<String, VecDeque<Instant>>,
}

impl SessionRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            calls: DashMap::new(),
        }
    }

    /// Records an attempt; returns false when the key is over its budget.
    pub fn check(&self, session_key: &str) -> bool {
        let now = Instant::now();
        let mut entry = self.calls.entry(session_key.to_string()).or_default();
        while let Some(front) = entry.front() {
            if now.duration_since(*front) > self.config.window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() as u32 >= self.config.max_calls {
            return false;
        }
        entry.push_back(now);
        true
    }
}
