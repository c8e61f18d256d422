//! Agent records and the directed permission graph between them.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::compress::CompactionConfig;
use crate::tools::ToolPolicy;

/// Default aggregate delegation capacity per target agent, applied when the
/// agent's `other` bundle does not carry `max_delegation_load`.
pub const DEFAULT_MAX_DELEGATION_LOAD: usize = 5;

/// Whether an agent shares its context files across users.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// No shared agent-level context files; every file is per-user.
    Open,
    /// All context files shared except the per-user personalization file.
    Predefined,
}

/// Spawn limits for the subagent controller.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SubagentLimits {
    pub max_spawn_depth: u32,
    pub max_concurrent: usize,
    pub max_children_per_parent: usize,
}

impl Default for SubagentLimits {
    fn default() -> Self {
        Self {
            max_spawn_depth: 1,
            max_concurrent: 8,
            max_children_per_parent: 5,
        }
    }
}

/// Pruning rules for the session log sanitizer.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PruneConfig {
    /// Log length past which low-value observations are dropped.
    pub max_messages: usize,
    /// Per-message tool-output cap in characters before truncation.
    pub max_tool_output_chars: usize,
}

impl Default for PruneConfig {
    fn default() -> Self {
        Self {
            max_messages: 200,
            max_tool_output_chars: 16_000,
        }
    }
}

/// Full per-agent configuration bundle set.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub tools: ToolPolicy,
    #[serde(default)]
    pub subagents: SubagentLimits,
    #[serde(default)]
    pub compaction: CompactionConfig,
    #[serde(default)]
    pub prune: PruneConfig,
    /// Open-ended bundle; recognized fields include `max_delegation_load`.
    #[serde(default)]
    pub other: serde_json::Value,
}

impl AgentConfig {
    /// Aggregate concurrent delegation capacity for this agent as target.
    pub fn max_delegation_load(&self) -> usize {
        self.other
            .get("max_delegation_load")
            .and_then(|v| v.as_u64())
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_DELEGATION_LOAD)
    }
}

/// A named, persistently configured actor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Stable opaque identifier.
    pub id: String,
    /// Human-facing key used to address the agent in messages.
    pub key: String,
    pub display_name: String,
    pub agent_type: AgentType,
    pub provider: String,
    pub model: String,
    /// Workspace root for file tools and context seeding.
    pub workspace: std::path::PathBuf,
    #[serde(default)]
    pub config: AgentConfig,
    /// Soft delete marker; deleted agents stay resolvable for history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl AgentRecord {
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// A minimal active record for tests.
    pub fn test(key: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            key: key.to_string(),
            display_name: key.to_string(),
            agent_type: AgentType::Open,
            provider: "openai".into(),
            model: "gpt-4.1-mini".into(),
            workspace: std::env::temp_dir().join(format!("trellis-{}", key)),
            config: AgentConfig::default(),
            deleted_at: None,
        }
    }
}

#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn get_by_key(&self, key: &str) -> Result<Option<AgentRecord>, StoreError>;
    async fn put(&self, agent: &AgentRecord) -> Result<(), StoreError>;
    /// Soft delete: the record stays, `deleted_at` is set.
    async fn soft_delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<AgentRecord>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryAgentStore {
    agents: DashMap<String, AgentRecord>,
}

impl InMemoryAgentStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, id: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.get(id).map(|a| a.clone()))
    }

    async fn get_by_key(&self, key: &str) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self
            .agents
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.clone()))
    }

    async fn put(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<(), StoreError> {
        match self.agents.get_mut(id) {
            Some(mut agent) => {
                agent.deleted_at = Some(chrono::Utc::now());
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("agent {}", id))),
        }
    }

    async fn list(&self) -> Result<Vec<AgentRecord>, StoreError> {
        Ok(self.agents.iter().map(|a| a.clone()).collect())
    }
}

/// Direction a link permits calls in, relative to its source/target pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkDirection {
    /// source → target only.
    Outbound,
    /// target → source only.
    Inbound,
    Bidirectional,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Disabled,
}

/// Per-link settings bag.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LinkSettings {
    /// When non-empty, only these user ids may trigger the link.
    #[serde(default)]
    pub user_allow: Vec<String>,
    /// These user ids may never trigger the link.
    #[serde(default)]
    pub user_deny: Vec<String>,
}

/// A directed permission edge between two agents.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentLink {
    pub id: String,
    pub source: String,
    pub target: String,
    pub direction: LinkDirection,
    pub max_concurrent: usize,
    pub status: LinkStatus,
    #[serde(default)]
    pub settings: LinkSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl AgentLink {
    /// Whether this link permits a call from `source` to `target`, by
    /// direction only (status and user lists are checked separately).
    pub fn permits(&self, source: &str, target: &str) -> bool {
        match self.direction {
            LinkDirection::Outbound => self.source == source && self.target == target,
            LinkDirection::Inbound => self.source == target && self.target == source,
            LinkDirection::Bidirectional => {
                (self.source == source && self.target == target)
                    || (self.source == target && self.target == source)
            }
        }
    }

    pub fn test(source: &str, target: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source: source.to_string(),
            target: target.to_string(),
            direction: LinkDirection::Outbound,
            max_concurrent: 3,
            status: LinkStatus::Active,
            settings: LinkSettings::default(),
            description: None,
        }
    }
}

#[async_trait]
pub trait AgentLinkStore: Send + Sync {
    async fn put(&self, link: &AgentLink) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    /// All links touching `agent_id`, in either role.
    async fn list_for(&self, agent_id: &str) -> Result<Vec<AgentLink>, StoreError>;
    /// First active link permitting `source → target`, if any.
    async fn find_permitting(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<AgentLink>, StoreError>;
}

#[derive(Default)]
pub struct InMemoryAgentLinkStore {
    links: DashMap<String, AgentLink>,
}

impl InMemoryAgentLinkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl AgentLinkStore for InMemoryAgentLinkStore {
    async fn put(&self, link: &AgentLink) -> Result<(), StoreError> {
        self.links.insert(link.id.clone(), link.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.links.remove(id);
        Ok(())
    }

    async fn list_for(&self, agent_id: &str) -> Result<Vec<AgentLink>, StoreError> {
        Ok(self
            .links
            .iter()
            .filter(|l| l.source == agent_id || l.target == agent_id)
            .map(|l| l.clone())
            .collect())
    }

    async fn find_permitting(
        &self,
        source: &str,
        target: &str,
    ) -> Result<Option<AgentLink>, StoreError> {
        Ok(self
            .links
            .iter()
            .find(|l| l.status == LinkStatus::Active && l.permits(source, target))
            .map(|l| l.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn soft_delete_keeps_record_but_marks_inactive() {
        let store = InMemoryAgentStore::default();
        let agent = AgentRecord::test("helper");
        store.put(&agent).await.unwrap();
        store.soft_delete(&agent.id).await.unwrap();
        let loaded = store.get(&agent.id).await.unwrap().unwrap();
        assert!(!loaded.is_active());
    }

    #[tokio::test]
    async fn get_by_key_finds_agent() {
        let store = InMemoryAgentStore::default();
        store.put(&AgentRecord::test("research")).await.unwrap();
        assert!(store.get_by_key("research").await.unwrap().is_some());
        assert!(store.get_by_key("absent").await.unwrap().is_none());
    }

    #[test]
    fn link_direction_semantics() {
        let mut link = AgentLink::test("a", "b");
        assert!(link.permits("a", "b"));
        assert!(!link.permits("b", "a"));

        link.direction = LinkDirection::Inbound;
        assert!(!link.permits("a", "b"));
        assert!(link.permits("b", "a"));

        link.direction = LinkDirection::Bidirectional;
        assert!(link.permits("a", "b"));
        assert!(link.permits("b", "a"));
    }

    #[tokio::test]
    async fn find_permitting_skips_disabled_links() {
        let store = InMemoryAgentLinkStore::default();
        let mut link = AgentLink::test("a", "b");
        link.status = LinkStatus::Disabled;
        store.put(&link).await.unwrap();
        assert!(store.find_permitting("a", "b").await.unwrap().is_none());

        link.status = LinkStatus::Active;
        store.put(&link).await.unwrap();
        assert!(store.find_permitting("a", "b").await.unwrap().is_some());
    }

    #[test]
    fn delegation_load_reads_other_bundle() {
        let mut agent = AgentRecord::test("a");
        assert_eq!(agent.config.max_delegation_load(), DEFAULT_MAX_DELEGATION_LOAD);
        agent.config.other = serde_json::json!({"max_delegation_load": 2});
        assert_eq!(agent.config.max_delegation_load(), 2);
    }
}
