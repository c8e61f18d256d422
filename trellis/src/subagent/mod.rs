//! Subagent controller: spawns restricted child runs of the agent loop and
//! announces their results back through the bus.
//!
//! Spawn admission checks three limits atomically (depth, global
//! concurrency, children per parent); an accepted spawn returns immediately
//! with a human-readable acceptance string while the child executes on the
//! `subagent` lane in a detached task. The loop is reached only through the
//! injected [`AgentRunFunc`], so this module never depends on the runner.

mod announce;

pub use announce::AnnounceQueue;

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRunFunc, PromptMode, RunRequest};
use crate::bus::{InboundMessage, MessageBus, PeerKind};
use crate::sched::{LanePool, LANE_SUBAGENT};
use crate::session::SessionKey;
use crate::store::SubagentLimits;
use crate::trace::TraceContext;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Where the parent run came from; announces are routed back here.
#[derive(Clone, Debug, Default)]
pub struct TaskOrigin {
    pub channel: String,
    pub chat_id: String,
    pub peer_kind: Option<PeerKind>,
    pub user_id: String,
    /// Rendered session key of the parent session.
    pub session_key: String,
}

/// A bounded child-of-agent execution record.
#[derive(Clone, Debug)]
pub struct SubagentTask {
    pub id: String,
    pub parent_agent_id: String,
    pub depth: u32,
    pub status: TaskStatus,
    pub task: String,
    pub label: String,
    pub model_override: Option<String>,
    pub origin: TaskOrigin,
    pub trace_id: String,
    /// Root span of the spawning run, carried into announce metadata.
    pub root_span_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
    pub result: Option<String>,
}

/// Everything a spawn call carries.
pub struct SpawnRequest {
    pub parent_agent_id: String,
    /// Depth of the *requesting* run; the child runs at `depth + 1`.
    pub depth: u32,
    pub limits: SubagentLimits,
    pub task: String,
    pub label: String,
    pub model_override: Option<String>,
    pub origin: TaskOrigin,
    pub trace: TraceContext,
}

#[derive(Clone, Debug)]
pub struct SubagentConfig {
    /// Iteration cap of the restricted child loop.
    pub max_iterations: usize,
    pub temperature: f32,
    /// Retention of finished task records.
    pub archive_ttl: Duration,
    /// Settle period between a steer's cancel and respawn.
    pub steer_settle: Duration,
    /// Steer message size cap in characters.
    pub max_steer_chars: usize,
    /// Announce coalescing window; zero disables coalescing.
    pub announce_debounce: Duration,
}

impl Default for SubagentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20,
            temperature: 0.5,
            archive_ttl: Duration::from_secs(60 * 60),
            steer_settle: Duration::from_millis(500),
            max_steer_chars: 4000,
            announce_debounce: Duration::from_millis(300),
        }
    }
}

struct TaskEntry {
    task: SubagentTask,
    cancel: CancellationToken,
}

pub struct SubagentManager {
    run: AgentRunFunc,
    lanes: Arc<LanePool>,
    announces: Arc<AnnounceQueue>,
    tasks: DashMap<String, TaskEntry>,
    /// Serializes spawn admission so the three limit checks and the record
    /// insert happen atomically.
    admission: Mutex<()>,
    config: SubagentConfig,
    /// Self-reference for detaching child tasks; set by `new`.
    weak_self: Weak<SubagentManager>,
}

impl SubagentManager {
    pub fn new(
        run: AgentRunFunc,
        bus: Arc<MessageBus>,
        lanes: Arc<LanePool>,
        config: SubagentConfig,
    ) -> Arc<Self> {
        let announces = AnnounceQueue::new(bus, config.announce_debounce);
        Arc::new_cyclic(|weak| Self {
            run,
            lanes,
            announces,
            tasks: DashMap::new(),
            admission: Mutex::new(()),
            config,
            weak_self: weak.clone(),
        })
    }

    fn running_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|e| e.task.status == TaskStatus::Running)
            .count()
    }

    fn children_of(&self, parent_agent_id: &str) -> usize {
        self.tasks
            .iter()
            .filter(|e| {
                e.task.status == TaskStatus::Running && e.task.parent_agent_id == parent_agent_id
            })
            .count()
    }

    /// Spawns a restricted child run. On success returns immediately with a
    /// human-readable acceptance string; on refusal the string explains
    /// which limit was hit, so the parent's LLM can adapt. No task record
    /// exists after a refusal.
    pub fn spawn(&self, req: SpawnRequest) -> Result<String, String> {
        let Some(this) = self.weak_self.upgrade() else {
            return Err("subagent manager is shutting down".to_string());
        };
        self.purge_expired();
        let label = if req.label.is_empty() {
            "unlabeled".to_string()
        } else {
            req.label.clone()
        };
        let task_id;
        let cancel;
        {
            let _admission = self.admission.lock().unwrap_or_else(|e| e.into_inner());
            if req.depth >= req.limits.max_spawn_depth {
                return Err(format!(
                    "spawn depth limit reached ({}/{})",
                    req.depth, req.limits.max_spawn_depth
                ));
            }
            let running = self.running_count();
            if running >= req.limits.max_concurrent {
                return Err(format!(
                    "subagent concurrency limit reached ({}/{})",
                    running, req.limits.max_concurrent
                ));
            }
            let children = self.children_of(&req.parent_agent_id);
            if children >= req.limits.max_children_per_parent {
                return Err(format!(
                    "per-parent subagent limit reached ({}/{})",
                    children, req.limits.max_children_per_parent
                ));
            }

            task_id = uuid::Uuid::new_v4().to_string();
            cancel = CancellationToken::new();
            let record = SubagentTask {
                id: task_id.clone(),
                parent_agent_id: req.parent_agent_id.clone(),
                depth: req.depth + 1,
                status: TaskStatus::Running,
                task: req.task.clone(),
                label: req.label.clone(),
                model_override: req.model_override.clone(),
                origin: req.origin.clone(),
                trace_id: req.trace.trace_id.clone(),
                root_span_id: req.trace.parent_span_id.clone(),
                created_at: chrono::Utc::now(),
                completed_at: None,
                result: None,
            };
            self.tasks.insert(
                task_id.clone(),
                TaskEntry {
                    task: record,
                    cancel: cancel.clone(),
                },
            );
        }

        let id = task_id.clone();
        tokio::spawn(async move {
            this.execute_child(id, req, cancel).await;
        });

        Ok(format!(
            "subagent {} accepted ({}); the result will be announced here when it finishes",
            task_id, label
        ))
    }

    async fn execute_child(
        self: Arc<Self>,
        task_id: String,
        req: SpawnRequest,
        cancel: CancellationToken,
    ) {
        let started = tokio::time::Instant::now();
        // Child runs under a fresh trace linked to the parent's, in its own
        // session, with the minimal prompt; the restricted tool surface is
        // enforced by depth in the policy engine.
        let child_trace = req.trace.linked_trace();
        let session_key = match SessionKey::new(
            &req.parent_agent_id,
            "subagent",
            PeerKind::Direct,
            &task_id,
        ) {
            Ok(k) => k,
            Err(e) => {
                self.finalize(&task_id, TaskStatus::Failed, Some(e.to_string()));
                return;
            }
        };

        let mut run_req = RunRequest::new(session_key, req.task.clone(), &req.origin.user_id);
        run_req.prompt_mode = PromptMode::Minimal;
        run_req.depth = req.depth + 1;
        run_req.model_override = req.model_override.clone();
        run_req.temperature = Some(self.config.temperature);
        run_req.max_iterations = Some(self.config.max_iterations);
        run_req.cancel = cancel.clone();
        run_req.trace = child_trace;
        run_req.channel = req.origin.channel.clone();
        run_req.chat_id = req.origin.chat_id.clone();
        if let Some(peer_kind) = req.origin.peer_kind {
            run_req.peer_kind = peer_kind;
        }

        let run = Arc::clone(&self.run);
        let outcome = self
            .lanes
            .submit(LANE_SUBAGENT, &cancel, (run)(run_req))
            .await;

        match outcome {
            Ok(Ok(result)) => {
                self.finalize(&task_id, TaskStatus::Completed, Some(result.content.clone()));
                self.announce(&task_id, &result.content, result.iterations, started)
                    .await;
            }
            Ok(Err(e)) if e.is_cancellation() => {
                self.finalize(&task_id, TaskStatus::Cancelled, None);
            }
            Err(_) if cancel.is_cancelled() => {
                self.finalize(&task_id, TaskStatus::Cancelled, None);
            }
            Ok(Err(e)) => {
                let error = e.to_string();
                self.finalize(&task_id, TaskStatus::Failed, Some(error.clone()));
                self.announce(&task_id, &format!("failed: {}", error), 0, started)
                    .await;
            }
            Err(e) => {
                let error = e.to_string();
                self.finalize(&task_id, TaskStatus::Failed, Some(error.clone()));
                self.announce(&task_id, &format!("failed: {}", error), 0, started)
                    .await;
            }
        }
    }

    fn finalize(&self, task_id: &str, status: TaskStatus, result: Option<String>) {
        if let Some(mut entry) = self.tasks.get_mut(task_id) {
            entry.task.status = status;
            entry.task.completed_at = Some(chrono::Utc::now());
            entry.task.result = result;
        }
    }

    /// Publishes the completion announce back to the parent session.
    async fn announce(
        &self,
        task_id: &str,
        body: &str,
        iterations: usize,
        started: tokio::time::Instant,
    ) {
        let Some(task) = self.tasks.get(task_id).map(|e| e.task.clone()) else {
            return;
        };
        if task.origin.channel.is_empty() {
            return;
        }
        let label = if task.label.is_empty() {
            "unlabeled"
        } else {
            &task.label
        };
        let content = format!(
            "[subagent {} finished] label={} iterations={} elapsed={:.1}s\n{}",
            task.id,
            label,
            iterations,
            started.elapsed().as_secs_f64(),
            body
        );
        let peer_kind = task.origin.peer_kind.unwrap_or(PeerKind::Direct);
        let mut message = InboundMessage {
            channel: "system".into(),
            sender_id: format!("subagent:{}", task.id),
            chat_id: task.origin.chat_id.clone(),
            peer_kind,
            content,
            user_id: task.origin.user_id.clone(),
            agent_key: String::new(),
            metadata: Default::default(),
        }
        .with_metadata("origin_channel", task.origin.channel.clone())
        .with_metadata("origin_peer_kind", peer_kind.as_str())
        .with_metadata("parent_agent", task.parent_agent_id.clone())
        .with_metadata("subagent_id", task.id.clone())
        .with_metadata("origin_trace_id", task.trace_id.clone());
        if let Some(root_span) = &task.root_span_id {
            message = message.with_metadata("origin_root_span_id", root_span.clone());
        }

        self.announces
            .publish(&task.origin.session_key, message)
            .await;
    }

    /// Cancels by id, `"all"`, or `"last"`. Returns how many running tasks
    /// were signalled; re-cancelling a finished task is a no-op.
    pub fn cancel(&self, selector: &str) -> usize {
        match selector {
            "all" => {
                let mut count = 0;
                for entry in self.tasks.iter() {
                    if entry.task.status == TaskStatus::Running && !entry.cancel.is_cancelled() {
                        entry.cancel.cancel();
                        count += 1;
                    }
                }
                count
            }
            "last" => {
                let last = self
                    .tasks
                    .iter()
                    .filter(|e| e.task.status == TaskStatus::Running && !e.cancel.is_cancelled())
                    .max_by_key(|e| e.task.created_at)
                    .map(|e| e.task.id.clone());
                match last {
                    Some(id) => self.cancel(&id),
                    None => 0,
                }
            }
            id => match self.tasks.get(id) {
                Some(entry)
                    if entry.task.status == TaskStatus::Running
                        && !entry.cancel.is_cancelled() =>
                {
                    entry.cancel.cancel();
                    1
                }
                _ => 0,
            },
        }
    }

    /// Cancels the task, waits the settle period, and spawns a replacement
    /// with the same origin and a size-capped new message.
    pub async fn steer(
        &self,
        task_id: &str,
        new_message: &str,
        limits: SubagentLimits,
    ) -> Result<String, String> {
        let old = self
            .tasks
            .get(task_id)
            .map(|e| e.task.clone())
            .ok_or_else(|| format!("no such subagent: {}", task_id))?;
        if self.cancel(task_id) == 0 {
            return Err(format!("subagent {} is not running", task_id));
        }
        tokio::time::sleep(self.config.steer_settle).await;

        let mut capped = new_message.to_string();
        if capped.chars().count() > self.config.max_steer_chars {
            let cut = capped
                .char_indices()
                .nth(self.config.max_steer_chars)
                .map(|(i, _)| i)
                .unwrap_or(capped.len());
            capped.truncate(cut);
        }
        self.spawn(SpawnRequest {
            parent_agent_id: old.parent_agent_id.clone(),
            depth: old.depth.saturating_sub(1),
            limits,
            task: capped,
            label: old.label.clone(),
            model_override: old.model_override.clone(),
            origin: old.origin.clone(),
            trace: TraceContext {
                trace_id: old.trace_id.clone(),
                parent_span_id: None,
                parent_trace_id: None,
            },
        })
    }

    pub fn list(&self, parent_agent_id: Option<&str>) -> Vec<SubagentTask> {
        let mut tasks: Vec<SubagentTask> = self
            .tasks
            .iter()
            .filter(|e| {
                parent_agent_id
                    .map(|p| e.task.parent_agent_id == p)
                    .unwrap_or(true)
            })
            .map(|e| e.task.clone())
            .collect();
        tasks.sort_by_key(|t| t.created_at);
        tasks
    }

    pub fn get(&self, task_id: &str) -> Option<SubagentTask> {
        self.tasks.get(task_id).map(|e| e.task.clone())
    }

    /// Drops finished tasks older than the archive TTL.
    pub fn purge_expired(&self) {
        let ttl = chrono::Duration::from_std(self.config.archive_ttl)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let now = chrono::Utc::now();
        let doomed: Vec<String> = self
            .tasks
            .iter()
            .filter(|e| {
                e.task.status != TaskStatus::Running
                    && e.task
                        .completed_at
                        .map(|t| now.signed_duration_since(t) > ttl)
                        .unwrap_or(false)
            })
            .map(|e| e.task.id.clone())
            .collect();
        for id in doomed {
            self.tasks.remove(&id);
        }
    }
}
