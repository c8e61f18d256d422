//! Tool registry: a concurrent name → tool map plus the per-call execution
//! pipeline (rate limit, execute, scrub, span).

use std::sync::Arc;

use dashmap::DashMap;

use crate::trace::{SpanBuilder, SpanKind, SpanStatus, TracingCollectorHandle};

use super::{
    scrub_credentials, CallContext, RateLimitConfig, SessionRateLimiter, Tool, ToolDef, ToolOutput,
};

/// Body returned for calls rejected by the session rate limiter; the text is
/// stable so models learn to back off.
pub const RATE_LIMIT_MESSAGE: &str = "rate limit exceeded";

pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
    limiter: SessionRateLimiter,
    tracer: TracingCollectorHandle,
}

impl ToolRegistry {
    pub fn new(rate_limit: RateLimitConfig, tracer: TracingCollectorHandle) -> Self {
        Self {
            tools: DashMap::new(),
            limiter: SessionRateLimiter::new(rate_limit),
            tracer,
        }
    }

    /// Registers a tool under its own name; replaces an existing tool with
    /// the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Provider-transport definitions for `names`, skipping unknown entries.
    pub fn provider_defs(&self, names: &[String]) -> Vec<ToolDef> {
        names
            .iter()
            .filter_map(|n| self.tools.get(n).map(|t| ToolDef::from(t.spec())))
            .collect()
    }

    /// Runs one tool call through the full pipeline. Never returns an error:
    /// every failure becomes an `is_error` output so the LLM can adapt.
    pub async fn execute(
        &self,
        name: &str,
        arguments: &str,
        ctx: &CallContext,
    ) -> ToolOutput {
        let Some(tool) = self.tools.get(name).map(|t| Arc::clone(&*t)) else {
            return ToolOutput::error(format!("unknown tool: {}", name));
        };

        if !self.limiter.check(&ctx.session_key) {
            return ToolOutput::error(RATE_LIMIT_MESSAGE);
        }

        let args: serde_json::Value = if arguments.trim().is_empty() {
            serde_json::json!({})
        } else {
            match serde_json::from_str(arguments) {
                Ok(v) => v,
                Err(e) => return ToolOutput::error(format!("invalid tool arguments: {}", e)),
            }
        };

        let span = SpanBuilder::start(&ctx.trace, SpanKind::Tool);
        let mut output = match tool.call(args, ctx).await {
            Ok(out) => out,
            Err(e) => ToolOutput::error(e.to_string()),
        };

        output.text = scrub_credentials(&output.text);
        output.user_text = output.user_text.as_deref().map(scrub_credentials);

        let status = if output.is_error {
            SpanStatus::Error
        } else {
            SpanStatus::Ok
        };
        let span = span
            .payload(serde_json::json!({
                "tool": name,
                "output_chars": output.text.len(),
                "is_error": output.is_error,
            }))
            .finish(status);
        tracing::debug!(tool = name, duration_ms = span.duration_ms, is_error = output.is_error, "tool call");
        self.tracer.emit(span);

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ToolError, ToolSpec};
    use async_trait::async_trait;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn spec(&self) -> ToolSpec {
            ToolSpec {
                name: "echo".into(),
                description: Some("Echo the input".into()),
                input_schema: serde_json::json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }),
            }
        }

        async fn call(
            &self,
            args: serde_json::Value,
            _ctx: &CallContext,
        ) -> Result<ToolOutput, ToolError> {
            let text = args
                .get("text")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ToolError::InvalidInput("missing text".into()))?;
            Ok(ToolOutput::text(text.to_string()))
        }
    }

    fn registry() -> ToolRegistry {
        let registry = ToolRegistry::new(
            RateLimitConfig::default(),
            TracingCollectorHandle::disabled(),
        );
        registry.register(Arc::new(EchoTool));
        registry
    }

    #[tokio::test]
    async fn executes_and_returns_output() {
        let r = registry();
        let out = r
            .execute("echo", r#"{"text":"hi"}"#, &CallContext::test("k"))
            .await;
        assert!(!out.is_error);
        assert_eq!(out.text, "hi");
    }

    #[tokio::test]
    async fn unknown_tool_is_error_output() {
        let r = registry();
        let out = r.execute("nope", "{}", &CallContext::test("k")).await;
        assert!(out.is_error);
        assert!(out.text.contains("unknown tool"));
    }

    #[tokio::test]
    async fn tool_error_becomes_is_error_output() {
        let r = registry();
        let out = r.execute("echo", "{}", &CallContext::test("k")).await;
        assert!(out.is_error);
        assert!(out.text.contains("missing text"));
    }

    #[tokio::test]
    async fn rate_limit_rejects_with_stable_body() {
        let r = ToolRegistry::new(
            RateLimitConfig {
                max_calls: 1,
                window: std::time::Duration::from_secs(60),
            },
            TracingCollectorHandle::disabled(),
        );
        r.register(Arc::new(EchoTool));
        let ctx = CallContext::test("k");
        let first = r.execute("echo", r#"{"text":"a"}"#, &ctx).await;
        assert!(!first.is_error);
        let second = r.execute("echo", r#"{"text":"b"}"#, &ctx).await;
        assert!(second.is_error);
        assert_eq!(second.text, RATE_LIMIT_MESSAGE);
    }

    #[tokio::test]
    async fn output_is_scrubbed() {
        struct LeakyTool;
        #[async_trait]
        impl Tool for LeakyTool {
            fn name(&self) -> &str {
                "leaky"
            }
            fn spec(&self) -> ToolSpec {
                ToolSpec {
                    name: "leaky".into(),
                    description: None,
                    input_schema: serde_json::json!({}),
                }
            }
            async fn call(
                &self,
                _args: serde_json::Value,
                _ctx: &CallContext,
            ) -> Result<ToolOutput, ToolError> {
                Ok(ToolOutput::text("api_key=verysecret999 done"))
            }
        }
        let r = registry();
        r.register(Arc::new(LeakyTool));
        let out = r.execute("leaky", "{}", &CallContext::test("k")).await;
        assert!(!out.text.contains("verysecret999"));
        assert!(out.text.contains("[REDACTED]"));
    }

    #[tokio::test]
    async fn provider_defs_filters_to_known_names() {
        let r = registry();
        let defs = r.provider_defs(&["echo".into(), "missing".into()]);
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].name, "echo");
    }
}
