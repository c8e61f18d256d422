//! Cross-agent delegation over the permission graph.
//!
//! A delegation call runs the target agent's loop either inline (sync) or
//! detached on the `delegate` lane (async). Admission walks the
//! precondition chain in order (scoped caller, both agents active, a
//! permitting link, the link's user allow/deny, per-link concurrency,
//! per-target aggregate load) and the first failure wins. Every rejection
//! is a descriptive string so the calling LLM can retry later, pick another
//! target, or handle the task itself.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunFunc, PromptMode, RunRequest};
use crate::bus::{BusEvent, InboundMessage, MessageBus, PeerKind, RunPhase};
use crate::sched::{LanePool, LANE_DELEGATE};
use crate::session::{SessionKey, SessionStore};
use crate::store::{AgentLinkStore, AgentRecord, AgentStore, TeamTaskStore};
use crate::subagent::TaskOrigin;
use crate::trace::TraceContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DelegateMode {
    Sync,
    Async,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DelegationStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// One peer-agent call in flight or finished.
#[derive(Clone, Debug)]
pub struct Delegation {
    pub id: String,
    pub link_id: String,
    pub source_agent_id: String,
    pub target_agent_id: String,
    pub user_id: String,
    pub mode: DelegateMode,
    pub session_key: String,
    pub status: DelegationStatus,
    pub origin: TaskOrigin,
    pub trace_id: String,
    /// Root span of the calling run, carried into announce metadata.
    pub root_span_id: Option<String>,
    pub team_task_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

pub struct DelegateRequest {
    /// Caller's agent id as resolved from context; `None` rejects.
    pub source_agent_id: Option<String>,
    /// Target agent key or id.
    pub target: String,
    pub user_id: String,
    pub task: String,
    pub mode: DelegateMode,
    pub origin: TaskOrigin,
    pub trace: TraceContext,
    /// External task to claim + complete on success.
    pub team_task_id: Option<String>,
}

#[derive(Debug)]
pub enum DelegateOutcome {
    /// Sync: the target's final content, returned inline.
    Sync {
        delegation_id: String,
        content: String,
    },
    /// Async: the call returned immediately; the result will arrive as an
    /// announce.
    Async { delegation_id: String },
}

/// The prompt fragment injected into every delegated run.
const DELEGATED_TASK_FRAGMENT: &str = "You are handling a delegated task from a peer agent. \
The reply is returned to the calling agent, not shown to a human. Do not address the end user, \
do not ask them questions; produce the requested result.";

struct DelegationEntry {
    delegation: Delegation,
    cancel: CancellationToken,
}

pub struct DelegateManager {
    run: AgentRunFunc,
    agents: Arc<dyn AgentStore>,
    links: Arc<dyn AgentLinkStore>,
    sessions: Arc<dyn SessionStore>,
    bus: Arc<MessageBus>,
    lanes: Arc<LanePool>,
    team_tasks: Option<Arc<dyn TeamTaskStore>>,
    active: DashMap<String, DelegationEntry>,
    /// Session keys of finished delegations, flushed after team-task
    /// completion.
    cleanup_keys: DashMap<String, Vec<String>>,
    /// Self-reference for detaching async delegations; set by `new`.
    weak_self: Weak<DelegateManager>,
}

impl DelegateManager {
    pub fn new(
        run: AgentRunFunc,
        agents: Arc<dyn AgentStore>,
        links: Arc<dyn AgentLinkStore>,
        sessions: Arc<dyn SessionStore>,
        bus: Arc<MessageBus>,
        lanes: Arc<LanePool>,
        team_tasks: Option<Arc<dyn TeamTaskStore>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            run,
            agents,
            links,
            sessions,
            bus,
            lanes,
            team_tasks,
            active: DashMap::new(),
            cleanup_keys: DashMap::new(),
            weak_self: weak.clone(),
        })
    }

    fn link_active_count(&self, link_id: &str) -> usize {
        self.active
            .iter()
            .filter(|e| {
                e.delegation.status == DelegationStatus::Running && e.delegation.link_id == link_id
            })
            .count()
    }

    fn target_active_count(&self, target_agent_id: &str) -> usize {
        self.active
            .iter()
            .filter(|e| {
                e.delegation.status == DelegationStatus::Running
                    && e.delegation.target_agent_id == target_agent_id
            })
            .count()
    }

    async fn resolve_agent(&self, key_or_id: &str) -> Option<AgentRecord> {
        if let Ok(Some(agent)) = self.agents.get(key_or_id).await {
            return Some(agent);
        }
        self.agents.get_by_key(key_or_id).await.ok().flatten()
    }

    /// Performs one delegation. Preconditions are checked in order; the
    /// first failure returns a descriptive string.
    pub async fn delegate(&self, req: DelegateRequest) -> Result<DelegateOutcome, String> {
        // 1. The caller must be agent-scoped.
        let source_id = req
            .source_agent_id
            .clone()
            .ok_or_else(|| "delegation requires an agent-scoped caller".to_string())?;

        // 2. Both ends must exist and be active.
        let source = self
            .resolve_agent(&source_id)
            .await
            .filter(AgentRecord::is_active)
            .ok_or_else(|| format!("source agent {} not found or inactive", source_id))?;
        let target = self
            .resolve_agent(&req.target)
            .await
            .filter(AgentRecord::is_active)
            .ok_or_else(|| format!("target agent {} not found or inactive", req.target))?;

        // 3. A link must permit source → target.
        let link = self
            .links
            .find_permitting(&source.id, &target.id)
            .await
            .map_err(|e| format!("link lookup failed: {}", e))?
            .ok_or_else(|| {
                format!(
                    "no active link permits delegation from {} to {}",
                    source.key, target.key
                )
            })?;

        // 4. The link's user allow/deny.
        if link.settings.user_deny.iter().any(|u| u == &req.user_id) {
            return Err(format!("user {} is denied on this link", req.user_id));
        }
        if !link.settings.user_allow.is_empty()
            && !link.settings.user_allow.iter().any(|u| u == &req.user_id)
        {
            return Err(format!("user {} is not allowed on this link", req.user_id));
        }

        // 5. Per-link concurrency.
        let link_active = self.link_active_count(&link.id);
        if link_active >= link.max_concurrent {
            return Err(format!(
                "link is at capacity ({}/{}); retry later or handle the task yourself",
                link_active, link.max_concurrent
            ));
        }

        // 6. Per-target aggregate load.
        let target_active = self.target_active_count(&target.id);
        let target_cap = target.config.max_delegation_load();
        if target_active >= target_cap {
            return Err(format!(
                "agent {} is at delegation capacity ({}/{}); retry later or pick another agent",
                target.key, target_active, target_cap
            ));
        }

        let delegation_id = uuid::Uuid::new_v4().to_string();
        let session_key = SessionKey::new(&target.id, "delegate", PeerKind::Direct, &source.id)
            .map_err(|e| format!("session key: {}", e))?;
        let cancel = CancellationToken::new();

        let delegation = Delegation {
            id: delegation_id.clone(),
            link_id: link.id.clone(),
            source_agent_id: source.id.clone(),
            target_agent_id: target.id.clone(),
            user_id: req.user_id.clone(),
            mode: req.mode,
            session_key: session_key.to_string(),
            status: DelegationStatus::Running,
            origin: req.origin.clone(),
            trace_id: req.trace.trace_id.clone(),
            root_span_id: req.trace.parent_span_id.clone(),
            team_task_id: req.team_task_id.clone(),
            created_at: chrono::Utc::now(),
        };
        self.active.insert(
            delegation_id.clone(),
            DelegationEntry {
                delegation,
                cancel: cancel.clone(),
            },
        );
        self.bus.broadcast(BusEvent::Delegation {
            delegation_id: delegation_id.clone(),
            source: source.key.clone(),
            target: target.key.clone(),
            phase: RunPhase::Started,
        });

        let mut run_req = RunRequest::new(session_key, req.task.clone(), &req.user_id);
        run_req.prompt_mode = PromptMode::Full;
        run_req.extra_system = Some(format!(
            "{} The calling agent is {}.",
            DELEGATED_TASK_FRAGMENT, source.key
        ));
        run_req.cancel = cancel.clone();

        match req.mode {
            DelegateMode::Sync => {
                // Sync nests under the caller's trace: the sub-run's
                // agent-root span parents to the caller's span.
                run_req.trace = req.trace.clone();
                match (self.run)(run_req).await {
                    Ok(result) => {
                        self.finish(&delegation_id, DelegationStatus::Completed, &result.content)
                            .await;
                        Ok(DelegateOutcome::Sync {
                            delegation_id,
                            content: result.content,
                        })
                    }
                    Err(e) if e.is_cancellation() => {
                        self.finish(&delegation_id, DelegationStatus::Cancelled, "").await;
                        Err("delegation cancelled".to_string())
                    }
                    Err(e) => {
                        self.finish(&delegation_id, DelegationStatus::Failed, "").await;
                        Err(format!("delegated run failed: {}", e))
                    }
                }
            }
            DelegateMode::Async => {
                // Async runs under a fresh trace linked back to the caller's.
                run_req.trace = req.trace.linked_trace();
                let Some(this) = self.weak_self.upgrade() else {
                    self.finish(&delegation_id, DelegationStatus::Failed, "").await;
                    return Err("delegate manager is shutting down".to_string());
                };
                let id = delegation_id.clone();
                tokio::spawn(async move {
                    this.execute_async(id, run_req, cancel).await;
                });
                Ok(DelegateOutcome::Async { delegation_id })
            }
        }
    }

    async fn execute_async(
        self: Arc<Self>,
        delegation_id: String,
        run_req: RunRequest,
        cancel: CancellationToken,
    ) {
        let started = tokio::time::Instant::now();
        let run = Arc::clone(&self.run);
        let outcome = self
            .lanes
            .submit(LANE_DELEGATE, &cancel, (run)(run_req))
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.finish(&delegation_id, DelegationStatus::Completed, &result.content)
                    .await;
                self.announce(&delegation_id, &result.content, result.iterations, started)
                    .await;
            }
            Ok(Err(e)) if e.is_cancellation() => {
                self.finish(&delegation_id, DelegationStatus::Cancelled, "").await;
            }
            Err(_) if cancel.is_cancelled() => {
                self.finish(&delegation_id, DelegationStatus::Cancelled, "").await;
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                self.finish(&delegation_id, DelegationStatus::Failed, "").await;
                self.announce(&delegation_id, &format!("failed: {}", error), 0, started)
                    .await;
            }
            Err(e) => {
                let error = e.to_string();
                self.finish(&delegation_id, DelegationStatus::Failed, "").await;
                self.announce(&delegation_id, &format!("failed: {}", error), 0, started)
                    .await;
            }
        }
    }

    async fn finish(&self, delegation_id: &str, status: DelegationStatus, result: &str) {
        let delegation = match self.active.get_mut(delegation_id) {
            Some(mut entry) => {
                entry.delegation.status = status;
                entry.delegation.clone()
            }
            None => return,
        };

        let phase = match status {
            DelegationStatus::Completed => RunPhase::Completed,
            DelegationStatus::Cancelled => RunPhase::Cancelled,
            _ => RunPhase::Failed,
        };
        self.bus.broadcast(BusEvent::Delegation {
            delegation_id: delegation_id.to_string(),
            source: delegation.source_agent_id.clone(),
            target: delegation.target_agent_id.clone(),
            phase,
        });

        // Track the delegated session for cleanup; on successful team-task
        // completion the tracked keys are flushed from the session store.
        self.cleanup_keys
            .entry(delegation_id.to_string())
            .or_default()
            .push(delegation.session_key.clone());

        if status == DelegationStatus::Completed {
            if let (Some(team), Some(task_id)) = (&self.team_tasks, &delegation.team_task_id) {
                let claim = team.claim(task_id, &delegation.source_agent_id).await;
                let complete = match claim {
                    Ok(()) => team.complete(task_id, result).await,
                    Err(e) => Err(e),
                };
                match complete {
                    Ok(()) => {
                        if let Some((_, keys)) = self.cleanup_keys.remove(delegation_id) {
                            for key in keys {
                                if let Err(e) = self.sessions.delete(&key).await {
                                    tracing::warn!(error = %e, key = %key, "delegation session cleanup failed");
                                }
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, task = %task_id, "team task completion failed");
                    }
                }
            }
        }
    }

    /// Publishes the async result back to the source agent's session.
    async fn announce(
        &self,
        delegation_id: &str,
        body: &str,
        iterations: usize,
        started: tokio::time::Instant,
    ) {
        let Some(delegation) = self.active.get(delegation_id).map(|e| e.delegation.clone())
        else {
            return;
        };
        if delegation.origin.channel.is_empty() {
            return;
        }
        let peer_kind = delegation.origin.peer_kind.unwrap_or(PeerKind::Direct);
        let mut message = InboundMessage {
            channel: "system".into(),
            sender_id: format!("delegate:{}", delegation.id),
            chat_id: delegation.origin.chat_id.clone(),
            peer_kind,
            content: format!(
                "[delegation {} finished] iterations={} elapsed={:.1}s\n{}",
                delegation.id,
                iterations,
                started.elapsed().as_secs_f64(),
                body
            ),
            user_id: delegation.user_id.clone(),
            agent_key: String::new(),
            metadata: Default::default(),
        }
        .with_metadata("origin_channel", delegation.origin.channel.clone())
        .with_metadata("origin_peer_kind", peer_kind.as_str())
        .with_metadata("parent_agent", delegation.source_agent_id.clone())
        .with_metadata("delegation_id", delegation.id.clone())
        .with_metadata("origin_trace_id", delegation.trace_id.clone());
        if let Some(root_span) = &delegation.root_span_id {
            message = message.with_metadata("origin_root_span_id", root_span.clone());
        }

        self.bus.publish_inbound(message).await;
    }

    /// Cancels a running delegation; returns false when it is not running.
    pub fn cancel(&self, delegation_id: &str) -> bool {
        match self.active.get(delegation_id) {
            Some(entry)
                if entry.delegation.status == DelegationStatus::Running
                    && !entry.cancel.is_cancelled() =>
            {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Running delegations originated by `source_agent_id`.
    pub fn list_active(&self, source_agent_id: &str) -> Vec<Delegation> {
        let mut out: Vec<Delegation> = self
            .active
            .iter()
            .filter(|e| {
                e.delegation.status == DelegationStatus::Running
                    && e.delegation.source_agent_id == source_agent_id
            })
            .map(|e| e.delegation.clone())
            .collect();
        out.sort_by_key(|d| d.created_at);
        out
    }

    pub fn get(&self, delegation_id: &str) -> Option<Delegation> {
        self.active.get(delegation_id).map(|e| e.delegation.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{RunError, RunResult};
    use crate::session::InMemorySessionStore;
    use crate::store::{
        AgentLink, InMemoryAgentLinkStore, InMemoryAgentStore, InMemoryTeamTaskStore,
        LinkDirection, TaskState,
    };
    use std::time::Duration;

    fn run_fn(content: &'static str, hold_ms: u64) -> AgentRunFunc {
        Arc::new(move |req: RunRequest| {
            Box::pin(async move {
                tokio::select! {
                    _ = req.cancel.cancelled() => Err(RunError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_millis(hold_ms)) => Ok(RunResult {
                        content: content.to_string(),
                        iterations: 1,
                    }),
                }
            })
        })
    }

    struct Fixture {
        manager: Arc<DelegateManager>,
        bus: Arc<MessageBus>,
        agents: Arc<InMemoryAgentStore>,
        links: Arc<InMemoryAgentLinkStore>,
        team: Arc<InMemoryTeamTaskStore>,
        source: AgentRecord,
        target: AgentRecord,
    }

    async fn fixture(run: AgentRunFunc) -> Fixture {
        let bus = MessageBus::new(16);
        let agents = InMemoryAgentStore::new();
        let links = InMemoryAgentLinkStore::new();
        let team = InMemoryTeamTaskStore::new();
        let sessions = InMemorySessionStore::new();

        let source = AgentRecord::test("caller");
        let target = AgentRecord::test("research");
        agents.put(&source).await.unwrap();
        agents.put(&target).await.unwrap();
        links.put(&AgentLink::test(&source.id, &target.id)).await.unwrap();

        let manager = DelegateManager::new(
            run,
            agents.clone(),
            links.clone(),
            sessions,
            bus.clone(),
            Arc::new(LanePool::with_defaults()),
            Some(team.clone()),
        );
        Fixture {
            manager,
            bus,
            agents,
            links,
            team,
            source,
            target,
        }
    }

    fn request(f: &Fixture, mode: DelegateMode) -> DelegateRequest {
        DelegateRequest {
            source_agent_id: Some(f.source.id.clone()),
            target: "research".into(),
            user_id: "u1".into(),
            task: "X".into(),
            mode,
            origin: TaskOrigin {
                channel: "telegram".into(),
                chat_id: "c1".into(),
                peer_kind: Some(PeerKind::Direct),
                user_id: "u1".into(),
                session_key: "agent:src:telegram:direct:c1".into(),
            },
            trace: TraceContext::new_root(),
            team_task_id: None,
        }
    }

    #[tokio::test]
    async fn sync_delegation_returns_content_inline() {
        let f = fixture(run_fn("OK", 0)).await;
        match f.manager.delegate(request(&f, DelegateMode::Sync)).await.unwrap() {
            DelegateOutcome::Sync { content, .. } => assert_eq!(content, "OK"),
            _ => panic!("expected sync outcome"),
        }
    }

    #[tokio::test]
    async fn async_delegation_returns_id_then_announces() {
        let f = fixture(run_fn("OK", 0)).await;
        let id = match f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap() {
            DelegateOutcome::Async { delegation_id } => delegation_id,
            _ => panic!("expected async outcome"),
        };

        let announce = f.bus.next_inbound().await.unwrap();
        assert_eq!(announce.channel, "system");
        assert_eq!(announce.sender_id, format!("delegate:{}", id));
        assert!(announce.content.contains("OK"));
        assert_eq!(
            announce.metadata.get("parent_agent").unwrap(),
            &f.source.id
        );
        assert_eq!(announce.metadata.get("delegation_id").unwrap(), &id);
    }

    #[tokio::test]
    async fn unscoped_caller_is_rejected_first() {
        let f = fixture(run_fn("OK", 0)).await;
        let mut req = request(&f, DelegateMode::Sync);
        req.source_agent_id = None;
        let err = f.manager.delegate(req).await.unwrap_err();
        assert!(err.contains("agent-scoped"));
    }

    #[tokio::test]
    async fn missing_link_is_rejected() {
        let f = fixture(run_fn("OK", 0)).await;
        // Reverse direction: target may not call source.
        let mut req = request(&f, DelegateMode::Sync);
        req.source_agent_id = Some(f.target.id.clone());
        req.target = "caller".into();
        let err = f.manager.delegate(req).await.unwrap_err();
        assert!(err.contains("no active link"));
    }

    #[tokio::test]
    async fn user_deny_and_allow_lists_gate_the_link() {
        let f = fixture(run_fn("OK", 0)).await;
        let mut link = f.links.find_permitting(&f.source.id, &f.target.id).await.unwrap().unwrap();
        link.settings.user_deny = vec!["u1".into()];
        f.links.put(&link).await.unwrap();
        let err = f.manager.delegate(request(&f, DelegateMode::Sync)).await.unwrap_err();
        assert!(err.contains("denied"));

        link.settings.user_deny = vec![];
        link.settings.user_allow = vec!["someone-else".into()];
        f.links.put(&link).await.unwrap();
        let err = f.manager.delegate(request(&f, DelegateMode::Sync)).await.unwrap_err();
        assert!(err.contains("not allowed"));
    }

    #[tokio::test]
    async fn link_capacity_rejects_with_retry_hint() {
        let f = fixture(run_fn("OK", 5_000)).await;
        let mut link = f.links.find_permitting(&f.source.id, &f.target.id).await.unwrap().unwrap();
        link.max_concurrent = 1;
        f.links.put(&link).await.unwrap();

        f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap();
        let err = f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap_err();
        assert!(err.contains("at capacity"));
    }

    #[tokio::test]
    async fn target_load_cap_reads_agent_config() {
        let f = fixture(run_fn("OK", 5_000)).await;
        let mut target = f.target.clone();
        target.config.other = serde_json::json!({"max_delegation_load": 1});
        f.agents.put(&target).await.unwrap();

        f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap();
        let err = f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap_err();
        assert!(err.contains("delegation capacity"));
    }

    #[tokio::test]
    async fn soft_deleted_target_is_rejected() {
        let f = fixture(run_fn("OK", 0)).await;
        f.agents.soft_delete(&f.target.id).await.unwrap();
        let err = f.manager.delegate(request(&f, DelegateMode::Sync)).await.unwrap_err();
        assert!(err.contains("not found or inactive"));
    }

    #[tokio::test]
    async fn team_task_is_claimed_and_completed_on_success() {
        let f = fixture(run_fn("the answer", 0)).await;
        let mut req = request(&f, DelegateMode::Sync);
        req.team_task_id = Some("task-9".into());
        f.manager.delegate(req).await.unwrap();
        assert_eq!(
            f.team.state("task-9"),
            Some(TaskState::Completed {
                result: "the answer".into()
            })
        );
    }

    #[tokio::test]
    async fn cancel_stops_async_delegation_without_announce() {
        let f = fixture(run_fn("OK", 5_000)).await;
        let id = match f.manager.delegate(request(&f, DelegateMode::Async)).await.unwrap() {
            DelegateOutcome::Async { delegation_id } => delegation_id,
            _ => panic!(),
        };
        assert_eq!(f.manager.list_active(&f.source.id).len(), 1);
        assert!(f.manager.cancel(&id));
        assert!(!f.manager.cancel(&id));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.manager.list_active(&f.source.id).is_empty());
        tokio::select! {
            _ = f.bus.next_inbound() => panic!("cancelled delegation must not announce"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
