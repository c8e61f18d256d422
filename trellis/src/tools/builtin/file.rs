//! Workspace file tools with interceptor routing.
//!
//! Paths resolve relative to the calling agent's workspace. The recognized
//! context filenames at the root and anything under `memory/` never touch
//! the filesystem; they route to the context-file and memory interceptors.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::context::{is_context_file, ContextFileInterceptor, MemoryInterceptor};
use crate::store::{AgentRecord, AgentStore};
use crate::tools::{CallContext, Tool, ToolError, ToolOutput, ToolSpec};

pub const TOOL_READ: &str = "read";
pub const TOOL_WRITE: &str = "write";
pub const TOOL_LIST: &str = "list";

const MAX_READ_CHARS: usize = 100_000;

/// Shared routing state for the three file tools.
pub struct FileRouter {
    context: Arc<ContextFileInterceptor>,
    memory: Arc<MemoryInterceptor>,
    agents: Arc<dyn AgentStore>,
}

enum Route {
    Context(String),
    Memory(String),
    Filesystem(PathBuf),
}

impl FileRouter {
    pub fn new(
        context: Arc<ContextFileInterceptor>,
        memory: Arc<MemoryInterceptor>,
        agents: Arc<dyn AgentStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            context,
            memory,
            agents,
        })
    }

    async fn agent(&self, ctx: &CallContext) -> Result<AgentRecord, ToolError> {
        self.agents
            .get(&ctx.agent_id)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
            .ok_or_else(|| ToolError::Execution(format!("unknown agent: {}", ctx.agent_id)))
    }

    /// Rejects traversal and absolute paths, then picks the backend.
    fn route(&self, workspace: &Path, raw: &str) -> Result<Route, ToolError> {
        let rel = raw.trim().trim_start_matches("./");
        if rel.is_empty() {
            return Err(ToolError::InvalidInput("empty path".into()));
        }
        let path = Path::new(rel);
        if path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(ToolError::InvalidInput(format!(
                "path must stay under the workspace: {}",
                raw
            )));
        }
        if MemoryInterceptor::intercepts(rel) {
            return Ok(Route::Memory(rel.to_string()));
        }
        if path.components().count() == 1 && is_context_file(rel) {
            return Ok(Route::Context(rel.to_string()));
        }
        Ok(Route::Filesystem(workspace.join(path)))
    }

    async fn read(&self, ctx: &CallContext, raw: &str) -> Result<String, ToolError> {
        match self.route(&ctx.workspace, raw)? {
            Route::Context(name) => {
                let agent = self.agent(ctx).await?;
                self.context
                    .read(&agent, &ctx.user_id, &name)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?
                    .ok_or_else(|| ToolError::InvalidInput(format!("file not found: {}", name)))
            }
            Route::Memory(path) => {
                let agent = self.agent(ctx).await?;
                self.memory
                    .read(&agent, &ctx.user_id, &path)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))?
                    .ok_or_else(|| ToolError::InvalidInput(format!("file not found: {}", path)))
            }
            Route::Filesystem(path) => {
                let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
                    ToolError::InvalidInput(format!("cannot read {}: {}", path.display(), e))
                })?;
                Ok(content)
            }
        }
    }

    async fn write(&self, ctx: &CallContext, raw: &str, content: &str) -> Result<(), ToolError> {
        match self.route(&ctx.workspace, raw)? {
            Route::Context(name) => {
                let agent = self.agent(ctx).await?;
                self.context
                    .write(&agent, &ctx.user_id, &name, content)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))
            }
            Route::Memory(path) => {
                let agent = self.agent(ctx).await?;
                self.memory
                    .write(&agent, &ctx.user_id, &path, content)
                    .await
                    .map_err(|e| ToolError::Execution(e.to_string()))
            }
            Route::Filesystem(path) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        ToolError::Execution(format!("mkdir {}: {}", parent.display(), e))
                    })?;
                }
                tokio::fs::write(&path, content).await.map_err(|e| {
                    ToolError::Execution(format!("write {}: {}", path.display(), e))
                })
            }
        }
    }
}

fn path_arg(args: &serde_json::Value) -> Result<&str, ToolError> {
    args.get("path")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidInput("missing path".into()))
}

/// Reads a file from the workspace or the virtual context/memory rows.
pub struct ReadTool {
    router: Arc<FileRouter>,
}

impl ReadTool {
    pub fn new(router: Arc<FileRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for ReadTool {
    fn name(&self) -> &str {
        TOOL_READ
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_READ.into(),
            description: Some(
                "Read a file. Path is relative to your workspace; AGENTS.md, SOUL.md etc. and memory/ are your context and memory files.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "File path relative to the workspace."}
                },
                "required": ["path"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let mut content = self.router.read(ctx, path_arg(&args)?).await?;
        if content.chars().count() > MAX_READ_CHARS {
            let cut = content
                .char_indices()
                .nth(MAX_READ_CHARS)
                .map(|(i, _)| i)
                .unwrap_or(content.len());
            content.truncate(cut);
            content.push_str("\n[truncated]");
        }
        Ok(ToolOutput::text(content))
    }
}

/// Writes a file; context/memory paths go to their interceptors.
pub struct WriteTool {
    router: Arc<FileRouter>,
}

impl WriteTool {
    pub fn new(router: Arc<FileRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for WriteTool {
    fn name(&self) -> &str {
        TOOL_WRITE
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_WRITE.into(),
            description: Some(
                "Write a file (overwrites). Writing an empty BOOTSTRAP.md finishes the first-run ritual; memory/*.md writes are indexed for recall.".into(),
            ),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string"},
                    "content": {"type": "string"}
                },
                "required": ["path", "content"]
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let path = path_arg(&args)?;
        let content = args
            .get("content")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::InvalidInput("missing content".into()))?;
        self.router.write(ctx, path, content).await?;
        Ok(ToolOutput::text(format!("wrote {}", path)))
    }
}

/// Lists a workspace directory.
pub struct ListTool {
    router: Arc<FileRouter>,
}

impl ListTool {
    pub fn new(router: Arc<FileRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl Tool for ListTool {
    fn name(&self) -> &str {
        TOOL_LIST
    }

    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: TOOL_LIST.into(),
            description: Some("List files in a workspace directory.".into()),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "path": {"type": "string", "description": "Directory relative to the workspace; omit for the root.", "default": "."}
                }
            }),
        }
    }

    async fn call(
        &self,
        args: serde_json::Value,
        ctx: &CallContext,
    ) -> Result<ToolOutput, ToolError> {
        let raw = args.get("path").and_then(|v| v.as_str()).unwrap_or(".");
        let dir = match self.router.route(&ctx.workspace, raw) {
            Ok(Route::Filesystem(p)) => p,
            Ok(_) => return Err(ToolError::InvalidInput("not a directory".into())),
            Err(_) if raw == "." => ctx.workspace.clone(),
            Err(e) => return Err(e),
        };
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&dir).await.map_err(|e| {
            ToolError::InvalidInput(format!("cannot list {}: {}", dir.display(), e))
        })?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            let suffix = match entry.file_type().await {
                Ok(t) if t.is_dir() => "/",
                _ => "",
            };
            entries.push(format!("{}{}", name, suffix));
        }
        entries.sort();
        Ok(ToolOutput::text(entries.join("\n")))
    }
}
