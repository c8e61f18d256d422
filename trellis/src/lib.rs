//! # Trellis
//!
//! A multi-tenant gateway between human end-users (messaging channels or a
//! WebSocket API) and LLM providers. Each agent gets a tool-using loop, a
//! persistent memory, and controlled delegation to peer agents and
//! subagents.
//!
//! The three core subsystems:
//!
//! 1. **Agent execution core** ([`agent`]): the think/act/observe loop with
//!    provider calls, tool dispatch, history management with compaction,
//!    and incremental streaming.
//! 2. **Lane + session scheduler** ([`sched`]): bounded concurrency pools
//!    combined with per-session serialization and queue-mode policy.
//! 3. **Delegation & subagent controller** ([`delegate`], [`subagent`]): a
//!    permissioned graph of agent-to-agent calls with depth/fanout limits
//!    and announce routing back through the bus.
//!
//! Everything else is a collaborator behind a trait: providers ([`llm`]),
//! tools ([`tools`]), stores ([`store`], [`session`]), context files
//! ([`context`]), tracing ([`trace`]). [`gateway`] is the composition root
//! that wires a running instance together.
//!
//! ```no_run
//! use std::sync::Arc;
//! use trellis::gateway::Gateway;
//! use trellis::llm::OpenAiChat;
//!
//! # async fn main_() {
//! let gateway = Arc::new(Gateway::builder().build(Arc::new(OpenAiChat::new())));
//! tokio::spawn(Arc::clone(&gateway).run_dispatcher());
//! # }
//! ```

pub mod agent;
pub mod bus;
pub mod cache;
pub mod compress;
pub mod context;
pub mod delegate;
pub mod gateway;
pub mod llm;
pub mod message;
pub mod sched;
pub mod session;
pub mod store;
pub mod subagent;
pub mod tools;
pub mod trace;

pub use agent::{AgentRunFunc, AgentRunner, PromptMode, RunError, RunRequest, RunResult};
pub use bus::{BusEvent, CacheDomain, InboundMessage, MessageBus, PeerKind, RunPhase};
pub use cache::{Cache, CacheError, InMemoryCache};
pub use compress::CompactionConfig;
pub use gateway::{Gateway, GatewayBuilder, GatewayConfig, OutboundMessage};
pub use llm::{ChatOptions, ChatRequest, ChatResponse, LlmClient, LlmError, LlmUsage, OpenAiChat, ScriptedLlm};
pub use message::{Message, Role, ToolCall};
pub use sched::{Admission, LanePool, LaneStats, QueueMode, SessionQueues, SessionQueuesConfig};
pub use session::{Session, SessionKey, SessionStore};
pub use store::{AgentLink, AgentRecord, AgentStore, AgentType, LinkDirection, SubagentLimits};
pub use subagent::{SubagentConfig, SubagentManager, SubagentTask, TaskStatus};
pub use delegate::{DelegateManager, DelegateMode, DelegateOutcome, Delegation};
pub use tools::{CallContext, Tool, ToolDef, ToolOutput, ToolPolicy, ToolProfile, ToolRegistry, ToolSpec};
pub use trace::{Span, SpanKind, SpanStatus, TraceContext, TracingCollector, TracingStore};
