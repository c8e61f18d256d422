//! Tools exposing the subagent controller to the LLM.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::store::{AgentStore, SubagentLimits};
use crate::subagent::{SpawnRequest, SubagentManager, TaskOrigin};
use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_SPAWN_SUBAGENT: &str = "spawn_subagent";
pub const TOOL_SUBAGENT_CANCEL: &str = "subagent_cancel";
pub const TOOL_SUBAGENT_STEER: &str = "subagent_steer";

fn origin_of(ctx: &CallContext) -> TaskOrigin {
    TaskOrigin {
        channel: ctx.channel.clone(),
        chat_id: ctx.chat_id.clone(),
        peer_kind: Some(ctx.peer_kind),
        user_id: ctx.user_id.clone(),
        session_key: ctx.session_key.clone(),
    }
}

async fn limits_of(agents: &Arc<dyn AgentStore>, ctx: &CallContext) -> SubagentLimits {
    match agents.get(&ctx.agent_id).await {
        Ok(Some(agent)) => agent.config.subagents,
        _ => SubagentLimits::default(),
    }
}

/// Spawns a background child run; the result is announced into this session.
pub struct SpawnSubagentTool {
    manager: Arc<SubagentManager>,
    agents: Arc<dyn AgentStore>,
}

impl SpawnSubagentTool {
    pub fn new(manager: Arc<SubagentManager>, agents: Arc<dyn AgentStore>) -> Self {
        Self { manager, agents }
    }
}

#[async_trait]
impl Tool for SpawnSubagentTool {
    fn name(&self) -> &str {
        TOOL_SPAWN_SUBAGENT
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SPAWN_SUBAGENT.into(),
            description: Some(
                "Spawn a background subagent for a task. Returns immediately; the result is announced in this conversation when the subagent finishes.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "task": {"type": "string", "description": "What the subagent should do."},
                    "label": {"type": "string", "description": "Short label shown in announces."},
                    "model": {"type": "string", "description": "Optional model override."}
                },
                "required": ["task"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let task = args
            .get("task")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing task".into()))?;
        let label = args.get("label").and_then(|v| v.as_str()).unwrap_or("");
        let model = args
            .get("model")
            .and_then(|v| v.as_str())
            .map(String::from);

        let result = self.manager.spawn(SpawnRequest {
            parent_agent_id: ctx.agent_id.clone(),
            depth: ctx.depth,
            limits: limits_of(&self.agents, ctx).await,
            task: task.to_string(),
            label: label.to_string(),
            model_override: model,
            origin: origin_of(ctx),
            trace: ctx.trace.clone(),
        });
        match result {
            Ok(accepted) => Ok(ToolOutput::text(accepted)),
            Err(refusal) => Ok(ToolOutput::error(refusal)),
        }
    }
}

/// Cancels subagents by id, `all`, or `last`.
pub struct SubagentCancelTool {
    manager: Arc<SubagentManager>,
}

impl SubagentCancelTool {
    pub fn new(manager: Arc<SubagentManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Tool for SubagentCancelTool {
    fn name(&self) -> &str {
        TOOL_SUBAGENT_CANCEL
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SUBAGENT_CANCEL.into(),
            description: Some("Cancel a running subagent by id, or 'all' / 'last'.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string", "description": "Subagent id, 'all', or 'last'."}
                },
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
        let cancelled = self.manager.cancel(id);
        if cancelled == 0 {
            Ok(ToolOutput::error(format!("nothing to cancel for '{}'", id)))
        } else {
            Ok(ToolOutput::text(format!("cancelled {} subagent(s)", cancelled)))
        }
    }
}

/// Cancels a running subagent and respawns it with a new instruction.
pub struct SubagentSteerTool {
    manager: Arc<SubagentManager>,
    agents: Arc<dyn AgentStore>,
}

impl SubagentSteerTool {
    pub fn new(manager: Arc<SubagentManager>, agents: Arc<dyn AgentStore>) -> Self {
        Self { manager, agents }
    }
}

#[async_trait]
impl Tool for SubagentSteerTool {
    fn name(&self) -> &str {
        TOOL_SUBAGENT_STEER
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SUBAGENT_STEER.into(),
            description: Some(
                "Redirect a running subagent: cancels it and respawns with the new message, keeping its origin.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "message": {"type": "string", "description": "New instruction."}
                },
                "required": ["id", "message"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let id = args
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing id".into()))?;
        let message = args
            .get("message")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing message".into()))?;
        match self
            .manager
            .steer(id, message, limits_of(&self.agents, ctx).await)
            .await
        {
            Ok(accepted) => Ok(ToolOutput::text(accepted)),
            Err(refusal) => Ok(ToolOutput::error(refusal)),
        }
    }
}
