//! Built-in tools: workspace files (interceptor-routed), exec, web fetch,
//! memory search, subagent control, delegation, sessions, cron.
//!
//! Construction-time dependencies only; everything per-call comes from
//! [`CallContext`](crate::tools::CallContext).

mod delegate_tools;
mod exec;
mod file;
mod memory_tools;
mod session_tools;
mod subagent_tools;
mod web;

pub use delegate_tools::{DelegateCancelTool, DelegateListTool, DelegateTool};
pub use exec::ExecTool;
pub use file::{FileRouter, ListTool, ReadTool, WriteTool};
pub use memory_tools::{MemoryGetTool, MemorySearchTool};
pub use session_tools::{SessionSendTool, SessionsListTool, WhoamiTool};
pub use subagent_tools::{SpawnSubagentTool, SubagentCancelTool, SubagentSteerTool};
pub use web::WebFetchTool;

use std::sync::Arc;

use crate::delegate::DelegateManager;
use crate::session::SessionStore;
use crate::store::{AgentStore, MemoryStore};
use crate::subagent::SubagentManager;
use crate::tools::ToolRegistry;

/// Registers the full built-in tool surface on `registry`.
#[allow(clippy::too_many_arguments)]
pub fn register_builtin_tools(
    registry: &ToolRegistry,
    router: Arc<FileRouter>,
    agents: Arc<dyn AgentStore>,
    memory: Arc<dyn MemoryStore>,
    sessions: Arc<dyn SessionStore>,
    bus: Arc<crate::bus::MessageBus>,
    subagents: Arc<SubagentManager>,
    delegates: Arc<DelegateManager>,
) {
    registry.register(Arc::new(ReadTool::new(Arc::clone(&router))));
    registry.register(Arc::new(WriteTool::new(Arc::clone(&router))));
    registry.register(Arc::new(ListTool::new(router)));
    registry.register(Arc::new(ExecTool::default()));
    registry.register(Arc::new(WebFetchTool::default()));
    registry.register(Arc::new(MemorySearchTool::new(Arc::clone(&memory))));
    registry.register(Arc::new(MemoryGetTool::new(memory)));
    registry.register(Arc::new(SessionSendTool::new(bus)));
    registry.register(Arc::new(SessionsListTool::new(sessions)));
    registry.register(Arc::new(WhoamiTool::new(Arc::clone(&agents))));
    registry.register(Arc::new(SpawnSubagentTool::new(
        Arc::clone(&subagents),
        Arc::clone(&agents),
    )));
    registry.register(Arc::new(SubagentCancelTool::new(Arc::clone(&subagents))));
    registry.register(Arc::new(SubagentSteerTool::new(subagents, agents)));
    registry.register(Arc::new(DelegateTool::new(Arc::clone(&delegates))));
    registry.register(Arc::new(DelegateListTool::new(Arc::clone(&delegates))));
    registry.register(Arc::new(DelegateCancelTool::new(delegates)));
}
