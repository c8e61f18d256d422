//! Long-term memory search and retrieval tools.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::store::{MemoryScope, MemoryStore};
use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_MEMORY_SEARCH: &str = "memory_search";
pub const TOOL_MEMORY_GET: &str = "memory_get";

fn scope_of(ctx: &CallContext) -> MemoryScope {
    MemoryScope {
        agent_id: ctx.agent_id.clone(),
        user_id: ctx.user_id.clone(),
    }
}

/// Semantic search over the calling agent/user's memory chunks.
pub struct MemorySearchTool {
    memory: Arc<dyn MemoryStore>,
}

impl MemorySearchTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemorySearchTool {
    fn name(&self) -> &str {
        TOOL_MEMORY_SEARCH
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_MEMORY_SEARCH.into(),
            description: Some(
                "Search your long-term memory semantically. Returns the best-matching chunks with ids.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 20, "default": 5}
                },
                "required": ["query"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing query".into()))?;
        let limit = args.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;

        let hits = self
            .memory
            .search(&scope_of(ctx), query, limit.clamp(1, 20))
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?;
        if hits.is_empty() {
            return Ok(ToolOutput::text("no matching memories"));
        }
        let lines: Vec<String> = hits
            .iter()
            .map(|h| {
                format!(
                    "[{}] ({:.2}, {}) {}",
                    h.record.id, h.score, h.record.path, h.record.text
                )
            })
            .collect();
        Ok(ToolOutput::text(lines.join("\n")))
    }
}

/// Fetches one memory chunk by id.
pub struct MemoryGetTool {
    memory: Arc<dyn MemoryStore>,
}

impl MemoryGetTool {
    pub fn new(memory: Arc<dyn MemoryStore>) -> Self {
        Self { memory }
    }
}

#[async_trait]
impl Tool for MemoryGetTool {
    fn name(&self) -> &str {
        TOOL_MEMORY_GET
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_MEMORY_GET.into(),
            description: Some("Fetch one memory chunk by its id (from memory_search).".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"}
                },
                "required": ["id"]
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
        match self
            .memory
            .get(&scope_of(ctx), id)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
        {
            Some(record) => Ok(ToolOutput::text(format!(
                "{} ({})\n{}",
                record.id, record.path, record.text
            ))),
            None => Ok(ToolOutput::error(format!("no memory with id {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HashEmbedder, InMemoryMemoryStore};

    #[tokio::test]
    async fn search_then_get_round_trip() {
        let memory = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        let mut ctx = CallContext::test("k");
        ctx.agent_id = "a1".into();
        ctx.user_id = "u1".into();

        memory
            .index(
                &scope_of(&ctx),
                "memory/facts.md",
                &["the user's cat is called Miso".to_string()],
            )
            .await
            .unwrap();

        let search = MemorySearchTool::new(memory.clone());
        let out = search
            .call(json!({"query": "what is the cat called"}), &ctx)
            .await
            .unwrap();
        assert!(out.text.contains("Miso"));

        let id = out
            .text
            .split('[')
            .nth(1)
            .and_then(|s| s.split(']').next())
            .unwrap()
            .to_string();
        let get = MemoryGetTool::new(memory);
        let out = get.call(json!({"id": id}), &ctx).await.unwrap();
        assert!(out.text.contains("Miso"));
    }

    #[tokio::test]
    async fn empty_results_are_reported() {
        let memory = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        let search = MemorySearchTool::new(memory);
        let out = search
            .call(json!({"query": "anything"}), &CallContext::test("k"))
            .await
            .unwrap();
        assert_eq!(out.text, "no matching memories");
    }
}
