//! Bounded shell execution in the agent's workspace.

use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_EXEC: &str = "exec";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_OUTPUT_CHARS: usize = 30_000;

/// Runs a shell command with the workspace as cwd, a wall-clock timeout,
/// and combined stdout/stderr capture.
pub struct ExecTool {
    timeout: Duration,
}

impl Default for ExecTool {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ExecTool {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Tool for ExecTool {
    fn name(&self) -> &str {
        TOOL_EXEC
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_EXEC.into(),
            description: Some(
                "Run a shell command in your workspace sandbox. Output is captured and truncated; long-running work belongs in a subagent.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": {"type": "string", "description": "Shell command line."}
                },
                "required": ["command"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let command = args
            .get("command")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing command".into()))?;

        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::Execution(format!("spawn failed: {}", e)))?;

        let waited = tokio::select! {
            r = child.wait_with_output() => r,
            _ = tokio::time::sleep(self.timeout) => {
                return Ok(ToolOutput::error(format!(
                    "command timed out after {}s", self.timeout.as_secs()
                )));
            }
            _ = ctx.cancel.cancelled() => {
                return Err(ToolError::Execution("cancelled".into()));
            }
        };
        let output = waited.map_err(|e| ToolError::Execution(format!("wait failed: {}", e)))?;

        let mut text = String::new();
        text.push_str(&String::from_utf8_lossy(&output.stdout));
        if !output.stderr.is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        if text.chars().count() > MAX_OUTPUT_CHARS {
            let cut = text
                .char_indices()
                .nth(MAX_OUTPUT_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(text.len());
            text.truncate(cut);
            text.push_str("\n[output truncated]");
        }

        if output.status.success() {
            Ok(ToolOutput::text(text))
        } else {
            Ok(ToolOutput::error(format!(
                "exit status {}: {}",
                output.status.code().unwrap_or(-1),
                text
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout() {
        let tool = ExecTool::default();
        let out = tool
            .call(json!({"command": "echo hello"}), &CallContext::test("k"))
            .await
            .unwrap();
        assert!(!out.is_error);
        assert_eq!(out.text.trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_error_output() {
        let tool = ExecTool::default();
        let out = tool
            .call(json!({"command": "exit 3"}), &CallContext::test("k"))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text.contains("exit status 3"));
    }

    #[tokio::test]
    async fn timeout_returns_error_output() {
        let tool = ExecTool::with_timeout(Duration::from_millis(50));
        let out = tool
            .call(json!({"command": "sleep 5"}), &CallContext::test("k"))
            .await
            .unwrap();
        assert!(out.is_error);
        assert!(out.text.contains("timed out"));
    }

    #[tokio::test]
    async fn runs_in_workspace_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = CallContext::test("k");
        ctx.workspace = dir.path().to_path_buf();
        let tool = ExecTool::default();
        let out = tool.call(json!({"command": "pwd"}), &ctx).await.unwrap();
        assert!(out.text.trim().ends_with(
            dir.path().file_name().unwrap().to_str().unwrap()
        ));
    }
}
