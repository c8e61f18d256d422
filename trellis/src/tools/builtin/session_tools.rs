//! Session-facing tools: cross-session sends, listings, identity.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::bus::{InboundMessage, MessageBus, PeerKind};
use crate::session::SessionStore;
use crate::store::AgentStore;
use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_SESSION_SEND: &str = "session_send";
pub const TOOL_SESSIONS_LIST: &str = "sessions_list";
pub const TOOL_WHOAMI: &str = "whoami";

/// Sends a message into another chat through the inbound queue, as if it
/// had arrived from that channel.
pub struct SessionSendTool {
    bus: Arc<MessageBus>,
}

impl SessionSendTool {
    pub fn new(bus: Arc<MessageBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Tool for SessionSendTool {
    fn name(&self) -> &str {
        TOOL_SESSION_SEND
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SESSION_SEND.into(),
            description: Some(
                "Send a message into another chat session on a channel you serve.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "channel": {"type": "string"},
                    "chat_id": {"type": "string"},
                    "content": {"type": "string"},
                    "peer_kind": {"type": "string", "enum": ["direct", "group"], "default": "direct"}
                },
                "required": ["channel", "chat_id", "content"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let channel = args
            .get("channel")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing channel".into()))?;
        let chat_id = args
            .get("chat_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing chat_id".into()))?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing content".into()))?;
        let peer_kind = match args.get("peer_kind").and_then(|v| v.as_str()) {
            Some("group") => PeerKind::Group,
            _ => PeerKind::Direct,
        };

        self.bus
            .publish_inbound(InboundMessage {
                channel: channel.to_string(),
                sender_id: format!("agent:{}", ctx.agent_id),
                chat_id: chat_id.to_string(),
                peer_kind,
                content: content.to_string(),
                user_id: ctx.user_id.clone(),
                agent_key: String::new(),
                metadata: Default::default(),
            })
            .await;
        Ok(ToolOutput::text(format!("sent to {}:{}", channel, chat_id)))
    }
}

/// Lists session keys known to the store.
pub struct SessionsListTool {
    sessions: Arc<dyn SessionStore>,
}

impl SessionsListTool {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Tool for SessionsListTool {
    fn name(&self) -> &str {
        TOOL_SESSIONS_LIST
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_SESSIONS_LIST.into(),
            description: Some("List known session keys for this gateway.".into()),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(
        &self,
        _args: serde_json::Value,
        _ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let keys = self
            .sessions
            .list_keys()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if keys.is_empty() {
            Ok(ToolOutput::text("no sessions"))
        } else {
            Ok(ToolOutput::text(keys.join("\n")))
        }
    }
}

/// Reports the calling agent's identity and origin.
pub struct WhoamiTool {
    agents: Arc<dyn AgentStore>,
}

impl WhoamiTool {
    pub fn new(agents: Arc<dyn AgentStore>) -> Self {
        Self { agents }
    }
}

#[async_trait]
impl Tool for WhoamiTool {
    fn name(&self) -> &str {
        TOOL_WHOAMI
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_WHOAMI.into(),
            description: Some("Report your agent identity, channel, and session.".into()),
            input_schema: json!({"type": "object", "properties": {}}),
        }
    }

    async fn call(
        &self,
        _args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let key = match self.agents.get(&ctx.agent_id).await {
            Ok(Some(agent)) => agent.key,
            _ => ctx.agent_id.clone(),
        };
        Ok(ToolOutput::text(format!(
            "agent={} channel={} chat={} user={} session={}",
            key, ctx.channel, ctx.chat_id, ctx.user_id, ctx.session_key
        )))
    }
}
