//! The think/act/observe loop.
//!
//! For a given (session, inbound message) pair, drives the provider to a
//! final assistant message while honoring tool calls, then runs the
//! post-loop bookkeeping: token counters, the memory-flush opportunity,
//! compaction, and an atomic session persist. The agent-root span is
//! emitted on every exit path, including cancellation, through the detached
//! collector handle.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compress::{compact_session, memory_flush, CompactionConfig};
use crate::context::{truncate_files, ContextBlock, ContextFileInterceptor, TruncationConfig, CONTEXT_FILES};
use crate::llm::{retry_chat, ChatOptions, ChatRequest, LlmClient, LlmError, RetryPolicy};
use crate::message::Message;
use crate::session::{Session, SessionBuffer, SessionStore};
use crate::store::{AgentRecord, AgentStore, Skill, SkillStore};
use crate::tools::{CallContext, PolicyQuery, ToolRegistry, resolve_allowed_tools};
use crate::trace::{SpanBuilder, SpanKind, SpanStatus, TracingCollectorHandle};

use super::prompt::{build_system_prompt, PromptInputs, PromptMode};
use super::sanitize::sanitize_log;
use super::{RunError, RunRequest, RunResult};

const DEFAULT_MAX_TOOL_ITERATIONS: usize = 12;

/// The loop with its injected collaborators. One instance serves all
/// agents; per-run state lives on the stack of [`AgentRunner::run`].
pub struct AgentRunner {
    default_provider: Arc<dyn LlmClient>,
    providers: HashMap<String, Arc<dyn LlmClient>>,
    registry: Arc<ToolRegistry>,
    sessions: Arc<dyn SessionStore>,
    agents: Arc<dyn AgentStore>,
    context: Arc<ContextFileInterceptor>,
    skills: Arc<dyn SkillStore>,
    tracer: TracingCollectorHandle,
    retry: RetryPolicy,
    truncation: TruncationConfig,
    max_tool_iterations: usize,
}

impl AgentRunner {
    pub fn new(
        default_provider: Arc<dyn LlmClient>,
        registry: Arc<ToolRegistry>,
        sessions: Arc<dyn SessionStore>,
        agents: Arc<dyn AgentStore>,
        context: Arc<ContextFileInterceptor>,
        skills: Arc<dyn SkillStore>,
        tracer: TracingCollectorHandle,
    ) -> Self {
        Self {
            default_provider,
            providers: HashMap::new(),
            registry,
            sessions,
            agents,
            context,
            skills,
            tracer,
            retry: RetryPolicy::default(),
            truncation: TruncationConfig::default(),
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
        }
    }

    /// Registers a named provider; agents select it by their `provider`
    /// field, falling back to the default.
    pub fn with_provider(mut self, name: impl Into<String>, client: Arc<dyn LlmClient>) -> Self {
        self.providers.insert(name.into(), client);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_truncation(mut self, truncation: TruncationConfig) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn with_max_tool_iterations(mut self, max: usize) -> Self {
        self.max_tool_iterations = max;
        self
    }

    fn provider_for(&self, agent: &AgentRecord) -> Arc<dyn LlmClient> {
        self.providers
            .get(&agent.provider)
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default_provider))
    }

    /// Drives one run to completion. The agent-root span is emitted on
    /// every exit, and the session buffer is flushed even when the run was
    /// cancelled mid-way so the log reflects the cancel point.
    pub async fn run(&self, req: RunRequest) -> Result<RunResult, RunError> {
        let root = SpanBuilder::start(&req.trace, SpanKind::AgentRoot);
        let run_trace = req.trace.child_of(root.span_id());
        let session_key = req.session_key.to_string();

        let result = self.run_inner(&req, &run_trace).await;

        let status = match &result {
            Ok(_) => SpanStatus::Ok,
            Err(e) if e.is_cancellation() => SpanStatus::Cancelled,
            Err(_) => SpanStatus::Error,
        };
        let span = root
            .payload(serde_json::json!({
                "session_key": session_key,
                "run_id": req.run_id,
                "iterations": result.as_ref().map(|r| r.iterations).unwrap_or(0),
            }))
            .finish(status);
        // Detached emit: the collector handle does not observe req.cancel.
        self.tracer.emit(span);
        result
    }

    async fn run_inner(
        &self,
        req: &RunRequest,
        run_trace: &crate::trace::TraceContext,
    ) -> Result<RunResult, RunError> {
        let agent = self
            .agents
            .get(&req.session_key.agent_id)
            .await?
            .filter(AgentRecord::is_active)
            .ok_or_else(|| RunError::UnknownAgent(req.session_key.agent_id.clone()))?;

        let llm = self.provider_for(&agent);
        let model = req
            .model_override
            .clone()
            .unwrap_or_else(|| agent.model.clone());
        let session_key = req.session_key.to_string();

        // Load the shared log into a run-private buffer; group runs flush
        // atomically at the end.
        let snapshot = self.sessions.get(&session_key).await?.unwrap_or_default();
        let mut buffer = SessionBuffer::new(&session_key, snapshot);

        // Tool availability for this (agent, provider, group, depth) tuple.
        let group_chat = req.peer_kind == crate::bus::PeerKind::Group;
        let tool_names = resolve_allowed_tools(
            &agent.config.tools,
            &PolicyQuery {
                provider: &agent.provider,
                group_chat,
                depth: req.depth,
                max_spawn_depth: agent.config.subagents.max_spawn_depth,
            },
            &self.registry.names(),
        );
        let tool_defs = self.registry.provider_defs(&tool_names);

        // System prompt: seeded on the first turn, replaced in place after.
        let context_blocks = self.load_context_blocks(&agent, &req.user_id, req.prompt_mode).await;
        let skills = self.load_skills(&agent, &req.content).await;
        let render_system = |session: &Session| {
            build_system_prompt(&PromptInputs {
                agent: &agent,
                mode: req.prompt_mode,
                user_id: &req.user_id,
                channel: &req.channel,
                chat_id: &req.chat_id,
                peer_kind: req.peer_kind,
                context_blocks: &context_blocks,
                skills: &skills,
                summary: session.summary.as_deref(),
                extra: req.extra_system.as_deref(),
                depth: req.depth,
                tool_names: &tool_names,
            })
        };
        let system = render_system(buffer.session());
        buffer.session_mut().set_system(system);
        buffer.session_mut().push(Message::user(req.content.clone()));

        let call_ctx = CallContext {
            session_key: session_key.clone(),
            agent_id: agent.id.clone(),
            user_id: req.user_id.clone(),
            channel: req.channel.clone(),
            chat_id: req.chat_id.clone(),
            peer_kind: req.peer_kind,
            sandbox_key: Some(agent.key.clone()),
            workspace: agent.workspace.clone(),
            depth: req.depth,
            trace: run_trace.clone(),
            cancel: req.cancel.clone(),
            notify: None,
        };

        let max_iterations = req.max_iterations.unwrap_or(self.max_tool_iterations);
        let mut compacted_this_run = false;
        let mut iterations = 0usize;
        let mut final_content = String::new();

        let outcome: Result<(), RunError> = 'run: {
            while iterations < max_iterations {
                if req.cancel.is_cancelled() {
                    break 'run Err(RunError::Cancelled);
                }
                iterations += 1;

                let provider_messages =
                    sanitize_log(&buffer.session().messages, &agent.config.prune);
                let chat_req = ChatRequest {
                    messages: provider_messages,
                    tools: tool_defs.clone(),
                    model: model.clone(),
                    options: ChatOptions {
                        temperature: req.temperature,
                        max_tokens: None,
                    },
                };

                let llm_span = SpanBuilder::start(run_trace, SpanKind::Llm);
                let response = retry_chat(
                    llm.as_ref(),
                    chat_req,
                    req.stream.clone(),
                    self.retry,
                    &req.cancel,
                )
                .await;
                let response = match response {
                    Ok(r) => {
                        self.tracer.emit(
                            llm_span
                                .payload(serde_json::json!({
                                    "model": model,
                                    "tool_calls": r.tool_calls.len(),
                                    "usage": r.usage,
                                }))
                                .finish(SpanStatus::Ok),
                        );
                        r
                    }
                    Err(e) => {
                        let status = if matches!(e, LlmError::Cancelled) {
                            SpanStatus::Cancelled
                        } else {
                            SpanStatus::Error
                        };
                        self.tracer.emit(llm_span.finish(status));

                        // One compaction attempt per run when the provider
                        // reports context exhaustion; fatal if still over.
                        if is_context_overflow(&e) && !compacted_this_run {
                            compacted_this_run = true;
                            iterations -= 1;
                            if let Err(compact_err) = self
                                .compact(&mut buffer, llm.as_ref(), &model, &agent, req, &call_ctx)
                                .await
                            {
                                break 'run Err(compact_err);
                            }
                            let system = render_system(buffer.session());
                            buffer.session_mut().set_system(system);
                            continue;
                        }
                        if is_context_overflow(&e) {
                            break 'run Err(RunError::ContextOverflow);
                        }
                        break 'run Err(e.into());
                    }
                };

                if let Some(usage) = response.usage {
                    let tokens = &mut buffer.session_mut().tokens;
                    tokens.prompt += usage.prompt_tokens as u64;
                    tokens.completion += usage.completion_tokens as u64;
                }

                if response.tool_calls.is_empty() {
                    final_content = response.content.clone();
                    buffer.session_mut().push(Message::assistant(response.content));
                    break 'run Ok(());
                }

                // Assistant message with tool-call descriptors, then one
                // tool-role result per call, in input order.
                buffer.session_mut().push(Message::assistant_with_calls(
                    response.content.clone(),
                    response.tool_calls.clone(),
                ));
                for call in &response.tool_calls {
                    if req.cancel.is_cancelled() {
                        break 'run Err(RunError::Cancelled);
                    }
                    let output = self
                        .registry
                        .execute(&call.name, &call.arguments, &call_ctx)
                        .await;
                    let text = if output.is_error {
                        format!("ERROR: {}", output.text)
                    } else {
                        output.text
                    };
                    buffer.session_mut().push(Message::tool(call.id.clone(), text));
                }

                // Follow-up turns merged while tools ran.
                if let Some(followups) = &req.followups {
                    for content in followups() {
                        buffer.session_mut().push(Message::user(content));
                    }
                }
            }

            if final_content.is_empty() && iterations >= max_iterations {
                tracing::warn!(max_iterations, "tool iteration budget exhausted");
                final_content = format!(
                    "(stopped after {} tool iterations without a final reply)",
                    iterations
                );
                buffer.session_mut().push(Message::assistant(final_content.clone()));
            }
            Ok(())
        };

        // Post-loop: memory flush + compaction when over the threshold. The
        // buffer still flushes below even when compaction fails, so the log
        // keeps what the run produced.
        let outcome = match outcome {
            Ok(()) if agent
                .config
                .compaction
                .should_compact(buffer.session().tokens.accumulated) =>
            {
                match self
                    .compact(&mut buffer, llm.as_ref(), &model, &agent, req, &call_ctx)
                    .await
                {
                    Ok(()) => {
                        let system = render_system(buffer.session());
                        buffer.session_mut().set_system(system);
                        Ok(())
                    }
                    Err(e) => Err(e),
                }
            }
            other => other,
        };

        // Persist the buffer even on cancellation so the log reflects the
        // cancel point.
        if let Err(store_err) = buffer.flush(self.sessions.as_ref()).await {
            tracing::warn!(error = %store_err, "session persist failed");
            if outcome.is_ok() {
                return Err(store_err.into());
            }
        }

        outcome.map(|_| RunResult {
            content: final_content,
            iterations,
        })
    }

    async fn compact(
        &self,
        buffer: &mut SessionBuffer,
        llm: &dyn LlmClient,
        model: &str,
        agent: &AgentRecord,
        req: &RunRequest,
        call_ctx: &CallContext,
    ) -> Result<(), RunError> {
        let compaction: &CompactionConfig = &agent.config.compaction;
        memory_flush(
            buffer.session(),
            llm,
            self.registry.as_ref(),
            call_ctx,
            model,
            compaction,
        )
        .await;
        compact_session(buffer.session_mut(), llm, model, compaction, &req.cancel).await?;
        Ok(())
    }

    /// Reads and truncates the context files for the prompt. Minimal-mode
    /// runs skip them entirely.
    async fn load_context_blocks(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        mode: PromptMode,
    ) -> Vec<ContextBlock> {
        if mode == PromptMode::Minimal {
            return Vec::new();
        }
        let mut files = Vec::new();
        for name in CONTEXT_FILES.iter().copied() {
            match self.context.read(agent, user_id, name).await {
                Ok(Some(content)) => files.push((name.to_string(), content)),
                Ok(None) => {}
                Err(e) => tracing::warn!(file = name, error = %e, "context file read failed"),
            }
        }
        truncate_files(&files, &self.truncation)
    }

    async fn load_skills(&self, agent: &AgentRecord, query: &str) -> Vec<Skill> {
        match self.skills.search(&agent.key, query, 5).await {
            Ok(skills) => skills,
            Err(e) => {
                tracing::warn!(error = %e, "skill search failed");
                Vec::new()
            }
        }
    }
}

/// Whether a provider error reports context-window exhaustion.
fn is_context_overflow(err: &LlmError) -> bool {
    let text = err.to_string().to_lowercase();
    text.contains("context length")
        || text.contains("context window")
        || text.contains("maximum context")
}
