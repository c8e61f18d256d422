//! Tools exposing delegation to the LLM. Rejections come back as error
//! tool results so the model can retry later, pick another target, or do
//! the work itself.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::delegate::{DelegateManager, DelegateMode, DelegateOutcome, DelegateRequest};
use crate::subagent::TaskOrigin;
use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_DELEGATE: &str = "delegate";
pub const TOOL_DELEGATE_LIST: &str = "delegate_list";
pub const TOOL_DELEGATE_CANCEL: &str = "delegate_cancel";

/// Calls a peer agent over the permission graph.
pub struct DelegateTool {
    manager: Arc<DelegateManager>,
}

impl DelegateTool {
    pub fn new(manager: Arc<DelegateManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for DelegateTool {
    fn name(&self) -> &str {
        TOOL_DELEGATE
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_DELEGATE.into(),
            description: Some(
                "Delegate a task to a peer agent you are linked with. mode=sync waits for the reply; mode=async returns a delegation id and the result is announced here later.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "agent": {"type": "string", "description": "Target agent key."},
                    "task": {"type": "string"},
                    "mode": {"type": "string", "enum": ["sync", "async"], "default": "sync"},
                    "team_task_id": {"type": "string", "description": "Optional external task to auto-complete."}
                },
                "required": ["agent", "task"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let agent = args
            .get("agent")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing agent".into()))?;
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing task".into()))?;
        let mode = match args.get("mode").and_then(|v| v.as_str()).unwrap_or("sync") {
            "async" => DelegateMode::Async,
            _ => DelegateMode::Sync,
        };

        let result = self
            .manager
            .delegate(DelegateRequest {
                source_agent_id: Some(ctx.agent_id.clone()),
                target: agent.to_string(),
                user_id: ctx.user_id.clone(),
                task: task.to_string(),
                mode,
                origin: TaskOrigin {
                    channel: ctx.channel.clone(),
                    chat_id: ctx.chat_id.clone(),
                    peer_kind: Some(ctx.peer_kind),
                    user_id: ctx.user_id.clone(),
                    session_key: ctx.session_key.clone(),
                },
                trace: ctx.trace.clone(),
                team_task_id: args
                    .get("team_task_id")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            })
            .await;

        match result {
            Ok(DelegateOutcome::Sync { content, .. }) => Ok(ToolOutput::text(content)),
            Ok(DelegateOutcome::Async { delegation_id }) => Ok(ToolOutput::text(format!(
                "delegation {} accepted; the result will be announced here",
                delegation_id
            ))),
            Err(refusal) => Ok(ToolOutput::error(refusal)),
        }
    }
}

/// Lists the caller's running delegations.
pub struct DelegateListTool {
    manager: Arc<DelegateManager>,
}

impl DelegateListTool {
    pub fn new(manager: Arc<DelegateManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for DelegateListTool {
    fn name(&self) -> &str {
        TOOL_DELEGATE_LIST
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_DELEGATE_LIST.into(),
            description: Some("List your running delegations.".into()),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(
        &self,
        _args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let active = self.manager.list_active(&ctx.agent_id);
        if active.is_empty() {
            return Ok(ToolOutput::text("no running delegations"));
        }
        let lines: Vec<String> = active
            .iter()
            .map(|d| format!("{} -> {} ({:?})", d.id, d.target_agent_id, d.mode))
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

/// Cancels a running delegation by id.
pub struct DelegateCancelTool {
    manager: Arc<DelegateManager>,
}

impl DelegateCancelTool {
    pub fn new(manager: Arc<DelegateManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for DelegateCancelTool {
    fn name(&self) -> &str {
        TOOL_DELEGATE_CANCEL
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_DELEGATE_CANCEL.into(),
            description: Some("Cancel a running delegation by id.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        _ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = args
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing id".into()))?;
        if self.manager.cancel(id) {
            Ok(ToolOutput::text(format!("delegation {} cancelled", id)))
        } else {
            Ok(ToolOutput::error(format!(
                "delegation {} is not running",
                id
            )))
        }
    }
}
