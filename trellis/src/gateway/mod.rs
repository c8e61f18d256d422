//! Gateway wiring: the explicit composition root and the dispatcher that
//! connects the bus to the scheduler and the loop.
//!
//! No module-level state anywhere: everything is constructed here and
//! injected by interface. The cyclic loop ↔ manager dependency is broken by
//! handing the managers an [`AgentRunFunc`] closure over the runner; the
//! runner never sees them.

mod dispatch;
mod heartbeat;

pub use dispatch::OutboundMessage;
pub use heartbeat::run_heartbeat;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunFunc, AgentRunner};
use crate::bus::{BusEvent, CacheDomain, MessageBus, DEFAULT_INBOUND_CAPACITY};
use crate::cache::{listen_for_invalidation, Cache, InMemoryCache};
use crate::context::{ContextFileInterceptor, ContextFileStore, InMemoryContextFileStore, MemoryInterceptor};
use crate::delegate::DelegateManager;
use crate::llm::LlmClient;
use crate::sched::{LanePool, SessionQueues, SessionQueuesConfig};
use crate::session::{InMemorySessionStore, SessionStore};
use crate::store::{
    AgentLinkStore, AgentRecord, AgentStore, CronStore, Embedder, HashEmbedder,
    InMemoryAgentLinkStore, InMemoryAgentStore, InMemoryCronStore, InMemoryMemoryStore,
    InMemorySkillStore, MemoryStore, SkillStore, TeamTaskStore,
};
use crate::subagent::{SubagentConfig, SubagentManager};
use crate::tools::builtin::{register_builtin_tools, FileRouter};
use crate::tools::{RateLimitConfig, ToolRegistry};
use crate::trace::{InMemoryTracingStore, TracingCollector, TracingStore};

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub queues: SessionQueuesConfig,
    pub subagents: SubagentConfig,
    pub rate_limit: RateLimitConfig,
    /// Agent addressed when an inbound message names none.
    pub default_agent_key: String,
    /// Hard deadline for draining on shutdown.
    pub shutdown_deadline: Duration,
    /// Cron poll interval.
    pub heartbeat_poll: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            queues: SessionQueuesConfig::default(),
            subagents: SubagentConfig::default(),
            rate_limit: RateLimitConfig::default(),
            default_agent_key: "main".into(),
            shutdown_deadline: Duration::from_secs(5),
            heartbeat_poll: Duration::from_secs(30),
        }
    }
}

/// The assembled gateway.
pub struct Gateway {
    pub bus: Arc<MessageBus>,
    pub lanes: Arc<LanePool>,
    pub queues: Arc<SessionQueues>,
    pub registry: Arc<ToolRegistry>,
    pub runner: Arc<AgentRunner>,
    pub run_fn: AgentRunFunc,
    pub subagents: Arc<SubagentManager>,
    pub delegates: Arc<DelegateManager>,
    pub agents: Arc<dyn AgentStore>,
    pub links: Arc<dyn AgentLinkStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub context_files: Arc<dyn ContextFileStore>,
    pub context: Arc<ContextFileInterceptor>,
    pub cron: Arc<dyn CronStore>,
    pub config: GatewayConfig,
    pub(crate) agent_cache: Arc<dyn Cache<String, AgentRecord>>,
    collector: Option<TracingCollector>,
    outbound: broadcast::Sender<OutboundMessage>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn builder() -> GatewayBuilder {
        GatewayBuilder::default()
    }

    /// Replies produced by runs, for channel adapters to deliver.
    pub fn subscribe_outbound(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Starts the cron poll loop; it stops with the gateway's shutdown
    /// token.
    pub fn start_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(run_heartbeat(
            Arc::clone(&self.cron),
            Arc::clone(&self.bus),
            self.config.heartbeat_poll,
            self.shutdown.clone(),
        ))
    }

    /// Broadcasts the shutdown event, stops intake, cancels running work,
    /// and drains the span collector under the configured deadline.
    pub async fn shutdown(mut self) {
        self.bus.broadcast(BusEvent::Shutdown);
        self.shutdown.cancel();
        let cancelled = self.queues.cancel_all();
        tracing::info!(cancelled, "gateway shutting down");
        if let Some(collector) = self.collector.take() {
            let _ = tokio::time::timeout(self.config.shutdown_deadline, collector.shutdown())
                .await;
        }
    }
}

/// Composition root builder; every collaborator can be swapped for a custom
/// implementation, with in-memory defaults for the rest.
pub struct GatewayBuilder {
    config: GatewayConfig,
    embedder: Option<Arc<dyn Embedder>>,
    agents: Option<Arc<dyn AgentStore>>,
    links: Option<Arc<dyn AgentLinkStore>>,
    sessions: Option<Arc<dyn SessionStore>>,
    context_files: Option<Arc<dyn ContextFileStore>>,
    memory: Option<Arc<dyn MemoryStore>>,
    skills: Option<Arc<dyn SkillStore>>,
    cron: Option<Arc<dyn CronStore>>,
    tracing_store: Option<Arc<dyn TracingStore>>,
    team_tasks: Option<Arc<dyn TeamTaskStore>>,
    lanes: Option<LanePool>,
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self {
            config: GatewayConfig::default(),
            embedder: None,
            agents: None,
            links: None,
            sessions: None,
            context_files: None,
            memory: None,
            skills: None,
            cron: None,
            tracing_store: None,
            team_tasks: None,
            lanes: None,
        }
    }
}

impl GatewayBuilder {
    pub fn config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Applies `TRELLIS_*` environment settings (default agent, queue mode,
    /// lane sizes) on top of the current config. Call
    /// `env_config::load_and_apply` first so `.env` and the XDG config file
    /// are visible.
    pub fn from_env(mut self) -> Self {
        let settings = env_config::GatewaySettings::from_env();
        self.config.default_agent_key = settings.default_agent;
        self.config.queues.mode = match settings.queue_mode.as_str() {
            "followup" => crate::sched::QueueMode::Followup,
            "interrupt" => crate::sched::QueueMode::Interrupt,
            _ => crate::sched::QueueMode::Queue,
        };
        self.lanes = Some(LanePool::new([
            (crate::sched::LANE_MAIN, settings.lane_main),
            (crate::sched::LANE_SUBAGENT, settings.lane_subagent),
            (crate::sched::LANE_DELEGATE, settings.lane_delegate),
            (crate::sched::LANE_CRON, settings.lane_cron),
        ]));
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn agents(mut self, agents: Arc<dyn AgentStore>) -> Self {
        self.agents = Some(agents);
        self
    }

    pub fn links(mut self, links: Arc<dyn AgentLinkStore>) -> Self {
        self.links = Some(links);
        self
    }

    pub fn sessions(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn context_files(mut self, store: Arc<dyn ContextFileStore>) -> Self {
        self.context_files = Some(store);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn skills(mut self, skills: Arc<dyn SkillStore>) -> Self {
        self.skills = Some(skills);
        self
    }

    pub fn cron(mut self, cron: Arc<dyn CronStore>) -> Self {
        self.cron = Some(cron);
        self
    }

    pub fn tracing_store(mut self, store: Arc<dyn TracingStore>) -> Self {
        self.tracing_store = Some(store);
        self
    }

    pub fn team_tasks(mut self, store: Arc<dyn TeamTaskStore>) -> Self {
        self.team_tasks = Some(store);
        self
    }

    pub fn lanes(mut self, lanes: LanePool) -> Self {
        self.lanes = Some(lanes);
        self
    }

    /// Wires everything. The provider is the one collaborator without a
    /// sensible default, so it is a required argument.
    pub fn build(self, provider: Arc<dyn LlmClient>) -> Gateway {
        let config = self.config;
        let bus = MessageBus::new(DEFAULT_INBOUND_CAPACITY);
        let lanes = Arc::new(self.lanes.unwrap_or_else(LanePool::with_defaults));
        let queues = Arc::new(SessionQueues::new(config.queues.clone()));

        let embedder = self
            .embedder
            .unwrap_or_else(|| Arc::new(HashEmbedder::default()));
        let agents = self.agents.unwrap_or_else(|| InMemoryAgentStore::new());
        let links = self.links.unwrap_or_else(|| InMemoryAgentLinkStore::new());
        let sessions = self.sessions.unwrap_or_else(|| InMemorySessionStore::new());
        let context_files = self
            .context_files
            .unwrap_or_else(|| InMemoryContextFileStore::new());
        let memory = self
            .memory
            .unwrap_or_else(|| InMemoryMemoryStore::new(Arc::clone(&embedder)));
        let skills = self
            .skills
            .unwrap_or_else(|| InMemorySkillStore::new(Arc::clone(&embedder)));
        let cron = self.cron.unwrap_or_else(|| InMemoryCronStore::new());
        let tracing_store = self
            .tracing_store
            .unwrap_or_else(|| Arc::new(InMemoryTracingStore::default()));

        let collector = TracingCollector::start(tracing_store);
        let tracer = collector.handle();

        let registry = Arc::new(ToolRegistry::new(config.rate_limit, tracer.clone()));
        let context = Arc::new(ContextFileInterceptor::new(Arc::clone(&context_files)));
        let memory_interceptor = Arc::new(MemoryInterceptor::new(
            Arc::clone(&context_files),
            Arc::clone(&memory),
        ));

        let runner = Arc::new(
            AgentRunner::new(
                Arc::clone(&provider),
                Arc::clone(&registry),
                Arc::clone(&sessions),
                Arc::clone(&agents),
                Arc::clone(&context),
                Arc::clone(&skills),
                tracer,
            ),
        );

        // The managers get the loop as a callback; the loop never imports
        // them.
        let run_fn: AgentRunFunc = {
            let runner = Arc::clone(&runner);
            Arc::new(move |req| {
                let runner = Arc::clone(&runner);
                Box::pin(async move { runner.run(req).await })
            })
        };

        let subagents = SubagentManager::new(
            Arc::clone(&run_fn),
            Arc::clone(&bus),
            Arc::clone(&lanes),
            config.subagents.clone(),
        );
        let delegates = DelegateManager::new(
            Arc::clone(&run_fn),
            Arc::clone(&agents),
            Arc::clone(&links),
            Arc::clone(&sessions),
            Arc::clone(&bus),
            Arc::clone(&lanes),
            self.team_tasks,
        );

        let router = FileRouter::new(
            Arc::clone(&context),
            memory_interceptor,
            Arc::clone(&agents),
        );
        register_builtin_tools(
            registry.as_ref(),
            router,
            Arc::clone(&agents),
            memory,
            Arc::clone(&sessions),
            Arc::clone(&bus),
            Arc::clone(&subagents),
            Arc::clone(&delegates),
        );

        // Read-through agent cache dropped on cache:agent events. The
        // listener task lives as long as the process.
        let agent_cache: Arc<dyn Cache<String, AgentRecord>> = Arc::new(InMemoryCache::new());
        let _ = listen_for_invalidation(&bus, CacheDomain::Agent, Arc::clone(&agent_cache));

        let (outbound, _) = broadcast::channel(256);

        Gateway {
            bus,
            lanes,
            queues,
            registry,
            runner,
            run_fn,
            subagents,
            delegates,
            agents,
            links,
            sessions,
            context_files,
            context,
            cron,
            config,
            agent_cache,
            collector: Some(collector),
            outbound,
            shutdown: CancellationToken::new(),
        }
    }
}
