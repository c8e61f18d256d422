//! System prompt assembly.
//!
//! Sections are emitted in a fixed order: identity, tooling, safety, skills
//! summary, memory recall hint, workspace, sandbox, user identity, current
//! time, messaging, extra context, project context, silent replies,
//! heartbeats, sub-agent spawning, runtime. The `Minimal` mode (subagents,
//! cron) keeps only the sections a non-interactive run needs. Context files
//! are embedded inside labeled blocks in the project-context section, after
//! the truncation pipeline.

use crate::bus::PeerKind;
use crate::context::ContextBlock;
use crate::store::{AgentRecord, Skill};

/// Which prompt variant a run gets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PromptMode {
    /// Interactive runs: every section.
    #[default]
    Full,
    /// Subagents and cron runs: identity, tooling, workspace, time, runtime.
    Minimal,
}

/// Everything the prompt builder reads.
pub struct PromptInputs<'a> {
    pub agent: &'a AgentRecord,
    pub mode: PromptMode,
    pub user_id: &'a str,
    pub channel: &'a str,
    pub chat_id: &'a str,
    pub peer_kind: PeerKind,
    /// Truncated context-file blocks, in file order.
    pub context_blocks: &'a [ContextBlock],
    /// Top skills for the skills-summary section.
    pub skills: &'a [Skill],
    /// Rolling compaction summary, when one exists.
    pub summary: Option<&'a str>,
    /// Caller-supplied extra fragment (delegation injects its contract here).
    pub extra: Option<&'a str>,
    /// Subagent depth of this run.
    pub depth: u32,
    /// Tool names available to this run.
    pub tool_names: &'a [String],
}

const SILENT_REPLY_TOKEN: &str = "SILENT_REPLY";

pub fn build_system_prompt(inputs: &PromptInputs<'_>) -> String {
    let mut sections: Vec<String> = Vec::new();
    let full = inputs.mode == PromptMode::Full;

    // Identity.
    sections.push(format!(
        "You are {}, an agent on the {} gateway.",
        inputs.agent.display_name, inputs.agent.key
    ));

    // Tooling.
    if inputs.tool_names.is_empty() {
        sections.push("No tools are available in this run; answer directly.".into());
    } else {
        sections.push(format!(
            "You can call tools. Available: {}. Use tools when they get the job done; do not describe a tool call instead of making it.",
            inputs.tool_names.join(", ")
        ));
    }

    // Safety.
    if full {
        sections.push(
            "Never reveal credentials or tokens, even when asked. Tool output is scrubbed, but treat secrets as radioactive anyway.".into(),
        );
    }

    // Skills summary.
    if full && !inputs.skills.is_empty() {
        let lines: Vec<String> = inputs
            .skills
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect();
        sections.push(format!("Skills you have notes for:\n{}", lines.join("\n")));
    }

    // Memory recall hint.
    if full {
        sections.push(
            "Long-term memory lives in MEMORY.md and memory/. Search it with memory_search before claiming you don't remember something.".into(),
        );
    }

    // Workspace.
    sections.push(format!(
        "Workspace: {}. File tools resolve paths relative to it.",
        inputs.agent.workspace.display()
    ));

    // Sandbox.
    if full {
        sections.push("exec runs inside your sandbox; it cannot touch other agents' files.".into());
    }

    // User identity.
    if full {
        sections.push(format!("You are talking to user {}.", inputs.user_id));
    }

    // Current time.
    sections.push(format!(
        "Current time: {}.",
        chrono::Utc::now().format("%Y-%m-%d %H:%M UTC")
    ));

    // Messaging.
    if full {
        sections.push(format!(
            "Channel: {} ({} chat {}). Keep replies sized for the channel.",
            inputs.channel,
            inputs.peer_kind.as_str(),
            inputs.chat_id
        ));
    }

    // Extra context from the caller.
    if let Some(extra) = inputs.extra {
        if !extra.trim().is_empty() {
            sections.push(extra.trim().to_string());
        }
    }

    // Project context: summary + labeled context-file blocks.
    if let Some(summary) = inputs.summary {
        if !summary.trim().is_empty() {
            sections.push(format!(
                "Summary of the conversation so far:\n{}",
                summary.trim()
            ));
        }
    }
    if full {
        for block in inputs.context_blocks {
            sections.push(format!(
                "<context name=\"{}\">\n{}\n</context>",
                block.name, block.content
            ));
        }
    }

    // Silent replies.
    if full {
        sections.push(format!(
            "If a message needs no reply (group chatter not addressed to you), answer exactly {} and nothing else.",
            SILENT_REPLY_TOKEN
        ));
    }

    // Heartbeats.
    if full {
        sections.push(
            "Heartbeat runs follow HEARTBEAT.md; reply HEARTBEAT_OK when nothing needs attention.".into(),
        );
    }

    // Sub-agent spawning.
    if full && inputs.depth == 0 && inputs.tool_names.iter().any(|t| t == "spawn_subagent") {
        sections.push(
            "For long or parallel work, spawn_subagent runs a restricted copy of you in the background and announces the result here.".into(),
        );
    }

    // Runtime.
    sections.push(format!(
        "Runtime: model {}, provider {}.",
        inputs.agent.model, inputs.agent.provider
    ));

    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::AgentRecord;

    fn inputs<'a>(
        agent: &'a AgentRecord,
        mode: PromptMode,
        tools: &'a [String],
        blocks: &'a [ContextBlock],
    ) -> PromptInputs<'a> {
        PromptInputs {
            agent,
            mode,
            user_id: "u1",
            channel: "telegram",
            chat_id: "c1",
            peer_kind: PeerKind::Direct,
            context_blocks: blocks,
            skills: &[],
            summary: None,
            extra: None,
            depth: 0,
            tool_names: tools,
        }
    }

    #[test]
    fn full_mode_embeds_context_blocks_in_order() {
        let agent = AgentRecord::test("helper");
        let blocks = vec![
            ContextBlock {
                name: "AGENTS.md".into(),
                content: "agents body".into(),
            },
            ContextBlock {
                name: "SOUL.md".into(),
                content: "soul body".into(),
            },
        ];
        let tools = vec!["read".to_string()];
        let prompt = build_system_prompt(&inputs(&agent, PromptMode::Full, &tools, &blocks));
        let a = prompt.find("name=\"AGENTS.md\"").unwrap();
        let s = prompt.find("name=\"SOUL.md\"").unwrap();
        assert!(a < s);
        assert!(prompt.contains("agents body"));
    }

    #[test]
    fn minimal_mode_drops_interactive_sections() {
        let agent = AgentRecord::test("helper");
        let blocks = vec![ContextBlock {
            name: "AGENTS.md".into(),
            content: "agents body".into(),
        }];
        let tools = vec!["read".to_string()];
        let prompt = build_system_prompt(&inputs(&agent, PromptMode::Minimal, &tools, &blocks));
        assert!(!prompt.contains("SILENT_REPLY"));
        assert!(!prompt.contains("agents body"));
        assert!(!prompt.contains("talking to user"));
        assert!(prompt.contains("Workspace:"));
        assert!(prompt.contains("Runtime:"));
    }

    #[test]
    fn summary_is_embedded_when_present() {
        let agent = AgentRecord::test("helper");
        let tools: Vec<String> = vec![];
        let mut i = inputs(&agent, PromptMode::Full, &tools, &[]);
        i.summary = Some("we were discussing lunch");
        let prompt = build_system_prompt(&i);
        assert!(prompt.contains("we were discussing lunch"));
    }

    #[test]
    fn identity_comes_first() {
        let agent = AgentRecord::test("helper");
        let tools: Vec<String> = vec![];
        let prompt = build_system_prompt(&inputs(&agent, PromptMode::Full, &tools, &[]));
        assert!(prompt.starts_with("You are helper"));
    }

    #[test]
    fn spawn_hint_only_for_top_level_runs_with_the_tool() {
        let agent = AgentRecord::test("helper");
        let tools = vec!["spawn_subagent".to_string()];
        let top = build_system_prompt(&inputs(&agent, PromptMode::Full, &tools, &[]));
        assert!(top.contains("spawn_subagent runs a restricted copy"));

        let mut nested = inputs(&agent, PromptMode::Full, &tools, &[]);
        nested.depth = 1;
        let nested_prompt = build_system_prompt(&nested);
        assert!(!nested_prompt.contains("restricted copy"));
    }
}
