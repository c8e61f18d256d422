//! Tool allow/deny policy resolution.
//!
//! The allow pipeline runs per (agent, provider, peer group, subagent
//! depth): profile base, group expansion, agent allow, provider allow,
//! group-chat allow, subagent baseline restrictions, leaf restrictions.
//! Deny subtraction and additive also-allow run after the pipeline. Groups
//! (`fs`, `runtime`, …) are syntactic sugar for tool-name sets anywhere a
//! list accepts names.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Baseline profile a policy starts from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolProfile {
    #[default]
    Full,
    Coding,
    Messaging,
    Minimal,
}

/// Tools every subagent is denied, regardless of policy.
pub const ALWAYS_DENIED_FOR_SUBAGENTS: &[&str] = &[
    "gateway",
    "session_send",
    "sessions_send",
    "cron_schedule",
    "cron_list",
    "memory_search",
    "memory_get",
    "whoami",
];

/// The spawn family, additionally denied for leaf subagents (at max depth).
pub const SPAWN_FAMILY: &[&str] = &[
    "spawn_subagent",
    "subagent_cancel",
    "subagent_steer",
    "delegate",
];

/// Named tool groups; sugar for the corresponding name lists.
const GROUPS: &[(&str, &[&str])] = &[
    ("fs", &["read", "write", "list"]),
    ("runtime", &["exec"]),
    ("web", &["web_fetch"]),
    ("memory", &["memory_search", "memory_get", "remember"]),
    ("sessions", &["sessions_list", "session_send"]),
    ("ui", &["notify_user"]),
    ("automation", &["cron_schedule", "cron_list"]),
    ("messaging", &["session_send", "sessions_send"]),
];

fn profile_base(profile: ToolProfile, all_tools: &[String]) -> BTreeSet<String> {
    match profile {
        ToolProfile::Full => all_tools.iter().cloned().collect(),
        ToolProfile::Coding => expand(&[
            "fs".into(),
            "runtime".into(),
            "web".into(),
            "memory".into(),
            "spawn_subagent".into(),
            "subagent_cancel".into(),
            "subagent_steer".into(),
        ]),
        ToolProfile::Messaging => expand(&[
            "messaging".into(),
            "sessions".into(),
            "memory".into(),
            "web".into(),
        ]),
        ToolProfile::Minimal => expand(&["read".into(), "write".into()]),
    }
}

/// Expands group names to member tools; plain names pass through.
fn expand(names: &[String]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for name in names {
        match GROUPS.iter().find(|(g, _)| *g == name.as_str()) {
            Some((_, members)) => out.extend(members.iter().map(|s| s.to_string())),
            None => {
                out.insert(name.clone());
            }
        }
    }
    out
}

/// Per-agent tool policy bundle.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ToolPolicy {
    #[serde(default)]
    pub profile: ToolProfile,
    /// When non-empty, intersected with the profile base (groups allowed).
    #[serde(default)]
    pub allow: Vec<String>,
    /// Subtracted after the allow pipeline (groups allowed).
    #[serde(default)]
    pub deny: Vec<String>,
    /// Added back after deny; cannot override subagent restrictions.
    #[serde(default)]
    pub also_allow: Vec<String>,
    /// Per-provider narrowing, keyed by provider name.
    #[serde(default)]
    pub provider_allow: std::collections::HashMap<String, Vec<String>>,
    /// Narrowing applied in group chats only.
    #[serde(default)]
    pub group_chat_allow: Vec<String>,
}

/// The tuple a resolution runs against.
#[derive(Clone, Debug)]
pub struct PolicyQuery<'a> {
    pub provider: &'a str,
    /// True when the session is a group chat.
    pub group_chat: bool,
    /// Subagent depth; 0 means a top-level run.
    pub depth: u32,
    /// Depth at which subagents may no longer spawn.
    pub max_spawn_depth: u32,
}

/// Resolves the tool names available to a run. `all_tools` is the full
/// registry listing; the result preserves registry order via sorting.
pub fn resolve_allowed_tools(
    policy: &ToolPolicy,
    query: &PolicyQuery<'_>,
    all_tools: &[String],
) -> Vec<String> {
    // Steps 1-2: profile base with group expansion.
    let mut allowed = profile_base(policy.profile, all_tools);

    // Step 3: agent-level allow narrows when present.
    if !policy.allow.is_empty() {
        let agent_allow = expand(&policy.allow);
        allowed.retain(|t| agent_allow.contains(t));
    }

    // Step 4: provider-specific narrowing.
    if let Some(provider_allow) = policy.provider_allow.get(query.provider) {
        if !provider_allow.is_empty() {
            let set = expand(provider_allow);
            allowed.retain(|t| set.contains(t));
        }
    }

    // Step 5: group-chat narrowing.
    if query.group_chat && !policy.group_chat_allow.is_empty() {
        let set = expand(&policy.group_chat_allow);
        allowed.retain(|t| set.contains(t));
    }

    // Step 6: subagent baseline restrictions.
    if query.depth > 0 {
        for denied in ALWAYS_DENIED_FOR_SUBAGENTS {
            allowed.remove(*denied);
        }
    }

    // Step 7: leaf subagents may not spawn further.
    let leaf = query.depth >= query.max_spawn_depth;
    if query.depth > 0 && leaf {
        for denied in SPAWN_FAMILY {
            allowed.remove(*denied);
        }
    }

    // Deny subtraction.
    for denied in expand(&policy.deny) {
        allowed.remove(&denied);
    }

    // Additive also-allow; hard subagent restrictions stay in force.
    for extra in expand(&policy.also_allow) {
        let hard_denied = (query.depth > 0 && ALWAYS_DENIED_FOR_SUBAGENTS.contains(&extra.as_str()))
            || (query.depth > 0 && leaf && SPAWN_FAMILY.contains(&extra.as_str()));
        if !hard_denied {
            allowed.insert(extra);
        }
    }

    // Only tools that actually exist in the registry survive.
    let known: BTreeSet<&String> = all_tools.iter().collect();
    allowed.retain(|t| known.contains(t));
    allowed.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_tools() -> Vec<String> {
        [
            "read",
            "write",
            "list",
            "exec",
            "web_fetch",
            "memory_search",
            "memory_get",
            "remember",
            "session_send",
            "sessions_list",
            "spawn_subagent",
            "subagent_cancel",
            "subagent_steer",
            "delegate",
            "whoami",
            "cron_schedule",
            "cron_list",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn query(depth: u32) -> PolicyQuery<'static> {
        PolicyQuery {
            provider: "openai",
            group_chat: false,
            depth,
            max_spawn_depth: 1,
        }
    }

    #[test]
    fn full_profile_allows_everything_at_depth_zero() {
        let tools = resolve_allowed_tools(&ToolPolicy::default(), &query(0), &all_tools());
        assert_eq!(tools.len(), all_tools().len());
    }

    #[test]
    fn subagents_lose_gateway_and_memory_reads() {
        let tools = resolve_allowed_tools(&ToolPolicy::default(), &query(1), &all_tools());
        assert!(!tools.contains(&"whoami".to_string()));
        assert!(!tools.contains(&"memory_search".to_string()));
        assert!(!tools.contains(&"session_send".to_string()));
        assert!(!tools.contains(&"cron_schedule".to_string()));
        assert!(tools.contains(&"read".to_string()));
    }

    #[test]
    fn leaf_subagents_lose_spawn_family() {
        let at_max = resolve_allowed_tools(&ToolPolicy::default(), &query(1), &all_tools());
        assert!(!at_max.contains(&"spawn_subagent".to_string()));
        assert!(!at_max.contains(&"delegate".to_string()));

        let below_max = resolve_allowed_tools(
            &ToolPolicy::default(),
            &PolicyQuery {
                max_spawn_depth: 2,
                ..query(1)
            },
            &all_tools(),
        );
        assert!(below_max.contains(&"spawn_subagent".to_string()));
    }

    #[test]
    fn deny_subtracts_and_also_allow_adds_back() {
        let policy = ToolPolicy {
            deny: vec!["runtime".into(), "web_fetch".into()],
            also_allow: vec!["web_fetch".into()],
            ..ToolPolicy::default()
        };
        let tools = resolve_allowed_tools(&policy, &query(0), &all_tools());
        assert!(!tools.contains(&"exec".to_string()));
        assert!(tools.contains(&"web_fetch".to_string()));
    }

    #[test]
    fn also_allow_cannot_restore_subagent_denied_tools() {
        let policy = ToolPolicy {
            also_allow: vec!["whoami".into(), "spawn_subagent".into()],
            ..ToolPolicy::default()
        };
        let tools = resolve_allowed_tools(&policy, &query(1), &all_tools());
        assert!(!tools.contains(&"whoami".to_string()));
        assert!(!tools.contains(&"spawn_subagent".to_string()));
    }

    #[test]
    fn groups_expand_in_allow_lists() {
        let policy = ToolPolicy {
            allow: vec!["fs".into()],
            ..ToolPolicy::default()
        };
        let tools = resolve_allowed_tools(&policy, &query(0), &all_tools());
        assert_eq!(tools, vec!["list", "read", "write"]);
    }

    #[test]
    fn group_chat_narrowing_applies_only_in_groups() {
        let policy = ToolPolicy {
            group_chat_allow: vec!["fs".into()],
            ..ToolPolicy::default()
        };
        let direct = resolve_allowed_tools(&policy, &query(0), &all_tools());
        assert!(direct.contains(&"exec".to_string()));
        let grouped = resolve_allowed_tools(
            &policy,
            &PolicyQuery {
                group_chat: true,
                ..query(0)
            },
            &all_tools(),
        );
        assert!(!grouped.contains(&"exec".to_string()));
        assert!(grouped.contains(&"read".to_string()));
    }

    #[test]
    fn minimal_profile_is_read_write_only() {
        let policy = ToolPolicy {
            profile: ToolProfile::Minimal,
            ..ToolPolicy::default()
        };
        let tools = resolve_allowed_tools(&policy, &query(0), &all_tools());
        assert_eq!(tools, vec!["read", "write"]);
    }
}
