//! Session-log sanitization before each provider call.
//!
//! Providers enforce structural constraints the raw log can violate after
//! pruning, compaction, or interrupted runs: every tool message must follow
//! an assistant message referencing its call id, content must be valid
//! UTF-8, oversized tool output bloats the context, and some providers
//! reject adjacent same-role messages. The sanitizer rewrites a copy of the
//! log; the stored session is untouched.

use std::collections::HashSet;

use crate::message::{Message, Role};
use crate::store::PruneConfig;

/// Marker appended where tool output was cut.
pub const OUTPUT_TRUNCATED_MARKER: &str = "\n[output truncated]";

/// Placeholder for observations dropped by pruning.
const PRUNED_PLACEHOLDER: &str = "[older tool output pruned]";

/// Produces the provider-facing message list.
pub fn sanitize_log(messages: &[Message], prune: &PruneConfig) -> Vec<Message> {
    let mut out = drop_orphan_tool_messages(messages);
    for m in &mut out {
        ensure_utf8(m);
        truncate_tool_output(m, prune.max_tool_output_chars);
    }
    prune_old_observations(&mut out, prune.max_messages);
    merge_adjacent_same_role(out)
}

/// (a) Every tool message must be preceded by an assistant message that
/// references its tool-call id; orphans are dropped. Assistant tool-call
/// lists keep only calls that still have results when a result follows;
/// trailing unanswered calls are left for the loop to answer.
fn drop_orphan_tool_messages(messages: &[Message]) -> Vec<Message> {
    let mut live_call_ids: HashSet<String> = HashSet::new();
    let mut out = Vec::with_capacity(messages.len());
    for m in messages {
        match m.role {
            Role::Assistant => {
                live_call_ids = m.tool_calls.iter().map(|c| c.id.clone()).collect();
                out.push(m.clone());
            }
            Role::Tool => {
                let ok = m
                    .tool_call_id
                    .as_ref()
                    .map(|id| live_call_ids.contains(id))
                    .unwrap_or(false);
                if ok {
                    out.push(m.clone());
                } else {
                    tracing::debug!("dropping orphan tool message");
                }
            }
            _ => {
                live_call_ids.clear();
                out.push(m.clone());
            }
        }
    }
    out
}

/// (b) Strings in Rust are always UTF-8; what can sneak in are interior NUL
/// and replacement-hostile control bytes from tool output. Strip them.
fn ensure_utf8(message: &mut Message) {
    if message
        .content
        .chars()
        .any(|c| c == '\u{0}' || (c.is_control() && c != '\n' && c != '\t' && c != '\r'))
    {
        message.content = message
            .content
            .chars()
            .filter(|c| *c != '\u{0}' && (!c.is_control() || *c == '\n' || *c == '\t' || *c == '\r'))
            .collect();
    }
}

/// (c) Oversized tool outputs are truncated with a marker.
fn truncate_tool_output(message: &mut Message, max_chars: usize) {
    if message.role != Role::Tool || max_chars == 0 {
        return;
    }
    let len = message.content.chars().count();
    if len <= max_chars {
        return;
    }
    let cut = message
        .content
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(message.content.len());
    message.content.truncate(cut);
    message.content.push_str(OUTPUT_TRUNCATED_MARKER);
}

/// (e) Past the per-agent cap, older tool observations are replaced with a
/// placeholder; the pairing structure stays intact.
fn prune_old_observations(messages: &mut [Message], max_messages: usize) {
    let len = messages.len();
    if max_messages == 0 || len <= max_messages {
        return;
    }
    let cutoff = len - max_messages;
    for m in messages[..cutoff].iter_mut() {
        if m.role == Role::Tool && m.content != PRUNED_PLACEHOLDER {
            m.content = PRUNED_PLACEHOLDER.to_string();
        }
    }
}

/// (d) Adjacent same-role user/system messages merge; assistant messages
/// with tool calls and tool results never merge (ids must stay distinct).
fn merge_adjacent_same_role(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    for m in messages {
        let mergeable = matches!(m.role, Role::User | Role::System);
        match out.last_mut() {
            Some(prev)
                if mergeable
                    && prev.role == m.role
                    && prev.tool_calls.is_empty()
                    && m.tool_calls.is_empty() =>
            {
                prev.content.push('\n');
                prev.content.push_str(&m.content);
            }
            _ => out.push(m),
        }
    }
    out
}
