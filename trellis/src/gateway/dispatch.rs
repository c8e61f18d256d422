//! The dispatcher: bus → commands → session key → admission → run.
//!
//! One consumer loop pulls inbound messages; each message is handled on its
//! own task so a slow session never blocks the intake. Command metadata
//! (`reset`, `stop`, `stopall`) is interpreted before the loop is invoked.
//! Announces (channel `system`) are re-routed to the parent session derived
//! from their origin metadata and run like any other message, so the parent
//! LLM sees the result as a user turn and reformulates it for the human.

use std::sync::Arc;

use serde::Serialize;

use crate::agent::{PromptMode, RunError, RunRequest};
use crate::bus::{BusEvent, InboundMessage, PeerKind, RunPhase};
use crate::context::{seed_agent_files, seed_user_files};
use crate::sched::{Admission, SessionGuard, LANE_CRON, LANE_MAIN};
use crate::session::{Session, SessionKey, DEFAULT_GROUP_CONCURRENCY};
use crate::store::{AgentRecord, AgentType};

use super::Gateway;

/// A reply ready for a channel adapter to deliver.
#[derive(Clone, Debug, Serialize)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
    /// Set on run failures; adapters render these as a short notice, never
    /// a traceback.
    pub is_failure: bool,
}

impl Gateway {
    /// Consumes inbound messages until shutdown. Intended to be spawned:
    /// `tokio::spawn(async move { gateway.run_dispatcher().await })`.
    pub async fn run_dispatcher(self: Arc<Self>) {
        let shutdown = self.shutdown.clone();
        loop {
            let message = tokio::select! {
                m = self.bus.next_inbound() => match m {
                    Some(m) => m,
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            };
            let this = Arc::clone(&self);
            tokio::spawn(async move {
                this.handle_inbound(message).await;
            });
        }
    }

    async fn handle_inbound(self: Arc<Self>, message: InboundMessage) {
        let Some(agent) = self.resolve_agent(&message).await else {
            tracing::warn!(agent_key = %message.agent_key, "inbound for unknown agent dropped");
            return;
        };

        let Some(session_key) = derive_session_key(&agent, &message) else {
            tracing::warn!(channel = %message.channel, "session key derivation failed");
            return;
        };
        let key = session_key.to_string();

        // Commands act on the session instead of starting a run.
        match message.command() {
            Some("reset") => {
                self.queues.cancel(&key);
                if let Err(e) = self.sessions.delete(&key).await {
                    tracing::warn!(error = %e, "session reset failed");
                }
                return;
            }
            Some("stop") => {
                let stopped = self.queues.cancel(&key);
                tracing::info!(stopped, session = %key, "stop command");
                return;
            }
            Some("stopall") => {
                let stopped = self.queues.cancel_all();
                tracing::info!(stopped, "stopall command");
                return;
            }
            _ => {}
        }

        // First contact provisions the per-user context files.
        if let Err(e) = seed_user_files(&self.context_files, &agent, &message.user_id).await {
            tracing::warn!(error = %e, "per-user seeding failed");
        }
        if agent.agent_type == AgentType::Predefined {
            if let Err(e) = seed_agent_files(&self.context_files, &agent).await {
                tracing::warn!(error = %e, "agent-level seeding failed");
            }
        }

        let concurrency = self.effective_concurrency(&agent, &key).await;
        match self.queues.admit(&key, message, concurrency).await {
            Admission::Start { message, guard } => {
                self.execute(message, guard).await;
            }
            Admission::Queued | Admission::Merged => {}
            Admission::Rejected { reason } => {
                tracing::warn!(session = %key, reason = %reason, "inbound rejected");
            }
        }
    }

    /// Runs the admitted message, then drains any batches queued behind it.
    async fn execute(&self, mut message: InboundMessage, mut guard: SessionGuard) {
        loop {
            self.run_one(&message, &guard).await;
            match self.queues.finish(guard).await {
                Some((queued, next_guard)) => {
                    message = queued;
                    guard = next_guard;
                }
                None => break,
            }
        }
    }

    async fn run_one(&self, message: &InboundMessage, guard: &SessionGuard) {
        let key = guard.key().to_string();
        let run_id = guard.run_id().to_string();
        let is_cron = message.channel == "cron";
        let lane = if is_cron { LANE_CRON } else { LANE_MAIN };

        // Announce metadata routes the reply to the origin channel.
        let (reply_channel, reply_chat) = reply_route(message);

        let session_key = match SessionKey::parse(&key) {
            Ok(k) => k,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable session key");
                return;
            }
        };

        let mut req = RunRequest::new(session_key, message.content.clone(), &message.user_id);
        req.run_id = run_id.clone();
        req.channel = message.channel.clone();
        req.chat_id = message.chat_id.clone();
        req.peer_kind = message.peer_kind;
        req.cancel = guard.cancel_token();
        req.prompt_mode = if is_cron {
            PromptMode::Minimal
        } else {
            PromptMode::Full
        };
        // Announce metadata threads the parent trace through for cross-trace
        // linking.
        if let Some(origin_trace) = message.metadata.get("origin_trace_id") {
            req.trace.parent_trace_id = Some(origin_trace.clone());
        }
        // Follow-up turns merged by the queues are drained inside the loop
        // between iterations.
        req.followups = Some(guard.followup_handle());

        self.bus.broadcast(BusEvent::Run {
            session_key: key.clone(),
            run_id: run_id.clone(),
            phase: RunPhase::Started,
        });

        let run_fn = Arc::clone(&self.run_fn);
        let cancel = guard.cancel_token();
        let outcome = self.lanes.submit(lane, &cancel, (run_fn)(req)).await;

        let (phase, outbound) = match outcome {
            Ok(Ok(result)) => (
                RunPhase::Completed,
                (!result.content.trim().is_empty()).then(|| OutboundMessage {
                    channel: reply_channel.clone(),
                    chat_id: reply_chat.clone(),
                    content: result.content,
                    is_failure: false,
                }),
            ),
            Ok(Err(e)) if e.is_cancellation() => (RunPhase::Cancelled, None),
            Err(_) if cancel.is_cancelled() => (RunPhase::Cancelled, None),
            Ok(Err(RunError::UnknownAgent(a))) => {
                tracing::warn!(agent = %a, "run rejected: unknown agent");
                (RunPhase::Failed, None)
            }
            Ok(Err(e)) => (
                RunPhase::Failed,
                Some(OutboundMessage {
                    channel: reply_channel.clone(),
                    chat_id: reply_chat.clone(),
                    content: format!("The agent run failed: {}", e),
                    is_failure: true,
                }),
            ),
            Err(e) => {
                tracing::warn!(error = %e, "lane submission failed");
                (RunPhase::Failed, None)
            }
        };

        self.bus.broadcast(BusEvent::Run {
            session_key: key,
            run_id,
            phase,
        });
        if let Some(outbound) = outbound {
            let _ = self.outbound.send(outbound);
        }
    }

    async fn resolve_agent(&self, message: &InboundMessage) -> Option<AgentRecord> {
        // Announces name the parent agent by id in metadata.
        let wanted = message
            .metadata
            .get("parent_agent")
            .cloned()
            .or_else(|| {
                (!message.agent_key.is_empty()).then(|| message.agent_key.clone())
            })
            .unwrap_or_else(|| self.config.default_agent_key.clone());

        if let Some(cached) = self.agent_cache.get(&wanted).await {
            return Some(cached);
        }
        let agent = match self.agents.get(&wanted).await {
            Ok(Some(a)) => Some(a),
            _ => self.agents.get_by_key(&wanted).await.ok().flatten(),
        }
        .filter(AgentRecord::is_active)?;
        let _ = self
            .agent_cache
            .set(wanted, agent.clone(), Some(std::time::Duration::from_secs(60)))
            .await;
        Some(agent)
    }

    /// Per-chat concurrency: 1 for direct chats; for groups the session
    /// hint, adaptively reduced to 1 once pending history nears the
    /// compaction threshold so summarization never interleaves.
    async fn effective_concurrency(&self, agent: &AgentRecord, key: &str) -> usize {
        let Ok(parsed) = SessionKey::parse(key) else {
            return 1;
        };
        if parsed.peer_kind != PeerKind::Group {
            return 1;
        }
        let session: Session = match self.sessions.get(key).await {
            Ok(Some(s)) => s,
            _ => return DEFAULT_GROUP_CONCURRENCY,
        };
        let trigger = agent.config.compaction.trigger_tokens();
        if trigger > 0 && session.tokens.accumulated as u64 * 10 >= trigger as u64 * 8 {
            return 1;
        }
        session
            .group_concurrency
            .unwrap_or(DEFAULT_GROUP_CONCURRENCY)
    }
}

/// Session key for an inbound message: announces route to the parent
/// session via origin metadata, everything else keys on (agent, channel,
/// peer, chat).
fn derive_session_key(agent: &AgentRecord, message: &InboundMessage) -> Option<SessionKey> {
    if message.channel == "system" {
        let channel = message.metadata.get("origin_channel")?;
        let peer_kind = message
            .metadata
            .get("origin_peer_kind")
            .and_then(|p| p.parse().ok())
            .unwrap_or(PeerKind::Direct);
        return SessionKey::new(&agent.id, channel, peer_kind, &message.chat_id).ok();
    }
    SessionKey::new(
        &agent.id,
        &message.channel,
        message.peer_kind,
        &message.chat_id,
    )
    .ok()
}

/// Where the reply goes: announces answer on the origin channel, everything
/// else on its own channel.
fn reply_route(message: &InboundMessage) -> (String, String) {
    if message.channel == "system" {
        if let Some(origin) = message.metadata.get("origin_channel") {
            return (origin.clone(), message.chat_id.clone());
        }
    }
    (message.channel.clone(), message.chat_id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlm;
    use crate::session::SessionStore;
    use crate::store::AgentStore;
    use std::time::Duration;

    async fn gateway(llm: ScriptedLlm) -> (Arc<Gateway>, AgentRecord) {
        let gateway = Gateway::builder().build(Arc::new(llm));
        let mut agent = AgentRecord::test("main");
        agent.key = "main".into();
        gateway.agents.put(&agent).await.unwrap();
        (Arc::new(gateway), agent)
    }

    fn inbound(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "telegram".into(),
            sender_id: "u1".into(),
            chat_id: "chat1".into(),
            peer_kind: PeerKind::Direct,
            content: content.into(),
            user_id: "u1".into(),
            agent_key: String::new(),
            metadata: Default::default(),
        }
    }

    #[tokio::test]
    async fn inbound_message_produces_outbound_reply() {
        let (gateway, agent) = gateway(ScriptedLlm::text("hello there")).await;
        let mut outbound = gateway.subscribe_outbound();
        tokio::spawn(Arc::clone(&gateway).run_dispatcher());

        gateway.bus.publish_inbound(inbound("hi")).await;
        let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.chat_id, "chat1");
        assert_eq!(reply.content, "hello there");
        assert!(!reply.is_failure);

        // The session was persisted under the derived key.
        let key = format!("agent:{}:telegram:direct:chat1", agent.id);
        assert!(gateway.sessions.get(&key).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn first_contact_seeds_user_files() {
        let (gateway, agent) = gateway(ScriptedLlm::text("ok")).await;
        let mut outbound = gateway.subscribe_outbound();
        tokio::spawn(Arc::clone(&gateway).run_dispatcher());

        gateway.bus.publish_inbound(inbound("hi")).await;
        let _ = tokio::time::timeout(Duration::from_secs(5), outbound.recv()).await;

        let soul = gateway
            .context_files
            .get_user_file(&agent.id, "u1", "SOUL.md")
            .await
            .unwrap();
        assert!(soul.is_some());
    }

    #[tokio::test]
    async fn reset_command_deletes_session_without_running() {
        let (gateway, agent) = gateway(ScriptedLlm::text("ok")).await;
        let key = format!("agent:{}:telegram:direct:chat1", agent.id);
        let mut session = Session::default();
        session.set_system("sys");
        gateway.sessions.put(&key, &session).await.unwrap();

        tokio::spawn(Arc::clone(&gateway).run_dispatcher());
        gateway
            .bus
            .publish_inbound(inbound("ignored").with_metadata("command", "reset"))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(gateway.sessions.get(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn announce_routes_to_parent_session_and_origin_channel() {
        let (gateway, agent) = gateway(ScriptedLlm::text("reformulated for you")).await;
        let mut outbound = gateway.subscribe_outbound();
        tokio::spawn(Arc::clone(&gateway).run_dispatcher());

        let announce = InboundMessage {
            channel: "system".into(),
            sender_id: "delegate:d1".into(),
            chat_id: "chat1".into(),
            peer_kind: PeerKind::Direct,
            content: "[delegation d1 finished] OK".into(),
            user_id: "u1".into(),
            agent_key: String::new(),
            metadata: Default::default(),
        }
        .with_metadata("origin_channel", "telegram")
        .with_metadata("origin_peer_kind", "direct")
        .with_metadata("parent_agent", agent.id.clone())
        .with_metadata("delegation_id", "d1");

        gateway.bus.publish_inbound(announce).await;
        let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        // The reply goes to the origin channel, not "system".
        assert_eq!(reply.channel, "telegram");
        assert_eq!(reply.content, "reformulated for you");

        // The announce text landed in the parent session as a user message.
        let key = format!("agent:{}:telegram:direct:chat1", agent.id);
        let session = gateway.sessions.get(&key).await.unwrap().unwrap();
        assert!(session
            .messages
            .iter()
            .any(|m| m.role == crate::message::Role::User
                && m.content.contains("[delegation d1 finished]")));
    }

    #[tokio::test]
    async fn unknown_agent_key_drops_message() {
        let (gateway, _agent) = gateway(ScriptedLlm::text("ok")).await;
        let mut outbound = gateway.subscribe_outbound();
        tokio::spawn(Arc::clone(&gateway).run_dispatcher());

        let mut m = inbound("hi");
        m.agent_key = "ghost".into();
        gateway.bus.publish_inbound(m).await;
        tokio::select! {
            _ = outbound.recv() => panic!("unknown agent must not produce output"),
            _ = tokio::time::sleep(Duration::from_millis(150)) => {}
        }
    }

    #[tokio::test]
    async fn run_failure_surfaces_as_notice_not_traceback() {
        let llm = ScriptedLlm::text("unused");
        llm.fail_next(crate::llm::LlmError::Fatal("schema error".into()));
        let (gateway, _agent) = gateway(llm).await;
        let mut outbound = gateway.subscribe_outbound();
        tokio::spawn(Arc::clone(&gateway).run_dispatcher());

        gateway.bus.publish_inbound(inbound("hi")).await;
        let reply = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(reply.is_failure);
        assert!(reply.content.contains("failed"));
    }
}
