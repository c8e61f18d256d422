//! Hierarchical span emission, decoupled from request lifetime.
//!
//! Spans describe the logical call graph of a run: an agent-root span with
//! llm/tool children, subagent-root spans linked across traces for
//! delegated work. Emission is non-blocking; a background flusher batches
//! spans into the [`TracingStore`]. Async work carries a detached
//! [`TraceContext`] copy so the root span is emitted even when the
//! triggering caller has already cancelled.

mod collector;
mod store;

pub use collector::{TracingCollector, TracingCollectorHandle};
pub use store::{InMemoryTracingStore, SqliteTracingStore, TracingStore};

use serde::{Deserialize, Serialize};

/// Span kind: which loop layer emitted it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    AgentRoot,
    Llm,
    Tool,
    SubagentRoot,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    Ok,
    Error,
    Cancelled,
}

/// One node of the trace tree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Cross-trace link for delegated calls and announces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_trace_id: Option<String>,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub duration_ms: u64,
    /// Model/input/output digests; never raw credentials (the registry
    /// scrubs tool output before it reaches a span payload).
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
}

/// The identity a unit of work carries through the call graph: enough to
/// parent new spans, nothing that ties it to the caller's cancellation.
#[derive(Clone, Debug, Default)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    /// Set when this trace was started on behalf of another trace
    /// (delegation, announce), for cross-trace linking.
    pub parent_trace_id: Option<String>,
}

impl TraceContext {
    /// Starts a fresh trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: None,
            parent_trace_id: None,
        }
    }

    /// Child context under `span_id` in the same trace.
    pub fn child_of(&self, span_id: &str) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(span_id.to_string()),
            parent_trace_id: self.parent_trace_id.clone(),
        }
    }

    /// New trace linked back to this one; used when delegated or announced
    /// work must not nest inside the caller's span tree.
    pub fn linked_trace(&self) -> Self {
        Self {
            trace_id: uuid::Uuid::new_v4().to_string(),
            parent_span_id: None,
            parent_trace_id: Some(self.trace_id.clone()),
        }
    }
}

/// In-progress span measurement; finish it to produce an emittable [`Span`].
pub struct SpanBuilder {
    span: Span,
    started: std::time::Instant,
}

impl SpanBuilder {
    pub fn start(ctx: &TraceContext, kind: SpanKind) -> Self {
        Self {
            span: Span {
                trace_id: ctx.trace_id.clone(),
                span_id: uuid::Uuid::new_v4().to_string(),
                parent_span_id: ctx.parent_span_id.clone(),
                parent_trace_id: ctx.parent_trace_id.clone(),
                kind,
                status: SpanStatus::Ok,
                started_at: chrono::Utc::now(),
                duration_ms: 0,
                payload: serde_json::Value::Null,
            },
            started: std::time::Instant::now(),
        }
    }

    pub fn span_id(&self) -> &str {
        &self.span.span_id
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.span.payload = payload;
        self
    }

    pub fn set_payload(&mut self, payload: serde_json::Value) {
        self.span.payload = payload;
    }

    pub fn finish(mut self, status: SpanStatus) -> Span {
        self.span.status = status;
        self.span.duration_ms = self.started.elapsed().as_millis() as u64;
        self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_context_keeps_trace_and_sets_parent_span() {
        let root = TraceContext::new_root();
        let child = root.child_of("span-1");
        assert_eq!(child.trace_id, root.trace_id);
        assert_eq!(child.parent_span_id.as_deref(), Some("span-1"));
    }

    #[test]
    fn linked_trace_starts_fresh_with_back_link() {
        let root = TraceContext::new_root();
        let linked = root.linked_trace();
        assert_ne!(linked.trace_id, root.trace_id);
        assert_eq!(linked.parent_trace_id.as_deref(), Some(root.trace_id.as_str()));
        assert!(linked.parent_span_id.is_none());
    }

    #[test]
    fn builder_measures_duration_and_status() {
        let ctx = TraceContext::new_root();
        let b = SpanBuilder::start(&ctx, SpanKind::Tool);
        let span = b.finish(SpanStatus::Error);
        assert_eq!(span.kind, SpanKind::Tool);
        assert_eq!(span.status, SpanStatus::Error);
        assert_eq!(span.trace_id, ctx.trace_id);
    }
}
