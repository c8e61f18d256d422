//! HTTP fetch tool.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_WEB_FETCH: &str = "web_fetch";

const MAX_BODY_CHARS: usize = 50_000;

/// Fetches a URL and returns the (truncated) body text.
pub struct WebFetchTool {
    client: reqwest::Client,
}

impl Default for WebFetchTool {
    fn default() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .user_agent("trellis-gateway")
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl Tool for WebFetchTool {
    fn name(&self) -> &str {
        TOOL_WEB_FETCH
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_WEB_FETCH.into(),
            description: Some("Fetch a URL over HTTP GET and return the body text.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {"type": "string", "description": "http(s) URL to fetch."}
                },
                "required": ["url"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let url = args
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing url".into()))?;
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(ToolError::InvalidInput(format!("not an http url: {}", url)));
        }

        let response = tokio::select! {
            r = self.client.get(url).send() => r,
            _ = ctx.cancel.cancelled() => return Err(ToolError::Execution("cancelled".into())),
        }
        .map_err(|e| ToolError::Transport(format!("fetch failed: {}", e)))?;

        let status = response.status();
        let mut body = response
            .text()
            .await
            .map_err(|e| ToolError::Transport(format!("body read failed: {}", e)))?;
        if body.chars().count() > MAX_BODY_CHARS {
            let cut = body
                .char_indices()
                .nth(MAX_BODY_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(body.len());
            body.truncate(cut);
            body.push_str("\n[truncated]");
        }

        if status.is_success() {
            Ok(ToolOutput::text(body))
        } else {
            Ok(ToolOutput::error(format!("HTTP {}: {}", status.as_u16(), body)))
        }
    }
}
