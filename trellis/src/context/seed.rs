//! Idempotent seeding of context files from embedded templates.
//!
//! First contact by a new user provisions the per-user file set via atomic
//! exclusive creates, so concurrent first messages from the same user seed
//! exactly once. Predefined agents additionally receive one agent-level
//! pass so shared files exist before any user writes them.

use std::sync::Arc;

use crate::store::{AgentRecord, AgentType, StoreError};

use super::files::{ContextFileStore, CONTEXT_FILES, MEMORY_INDEX, PERSONALIZATION_FILE};

/// Embedded template for `name`, if it is a recognized context file.
pub fn template_for(name: &str) -> Option<&'static str> {
    match name {
        "AGENTS.md" => Some(include_str!("templates/AGENTS.md")),
        "SOUL.md" => Some(include_str!("templates/SOUL.md")),
        "TOOLS.md" => Some(include_str!("templates/TOOLS.md")),
        "IDENTITY.md" => Some(include_str!("templates/IDENTITY.md")),
        "USER.md" => Some(include_str!("templates/USER.md")),
        "HEARTBEAT.md" => Some(include_str!("templates/HEARTBEAT.md")),
        "BOOTSTRAP.md" => Some(include_str!("templates/BOOTSTRAP.md")),
        "MEMORY.md" => Some(include_str!("templates/MEMORY.md")),
        _ => None,
    }
}

/// Seeds agent-level rows for a predefined agent. Safe to call repeatedly;
/// existing rows are never overwritten.
pub async fn seed_agent_files(
    store: &Arc<dyn ContextFileStore>,
    agent: &AgentRecord,
) -> Result<usize, StoreError> {
    let mut created = 0;
    for name in CONTEXT_FILES.iter().chain([MEMORY_INDEX].iter()).copied() {
        // The personalization file stays per-user even for predefined agents.
        if agent.agent_type == AgentType::Predefined && name == PERSONALIZATION_FILE {
            continue;
        }
        if let Some(template) = template_for(name) {
            if store
                .create_agent_file_if_absent(&agent.id, name, template)
                .await?
            {
                created += 1;
            }
        }
    }
    Ok(created)
}

/// Seeds the per-user file set on first contact. For open agents that is
/// every context file; for predefined agents only the personalization file.
pub async fn seed_user_files(
    store: &Arc<dyn ContextFileStore>,
    agent: &AgentRecord,
    user_id: &str,
) -> Result<usize, StoreError> {
    let names: Vec<&str> = match agent.agent_type {
        AgentType::Open => CONTEXT_FILES.iter().chain([MEMORY_INDEX].iter()).copied().collect(),
        AgentType::Predefined => vec![PERSONALIZATION_FILE],
    };
    let mut created = 0;
    for name in names {
        if let Some(template) = template_for(name) {
            if store
                .create_user_file_if_absent(&agent.id, user_id, name, template)
                .await?
            {
                created += 1;
            }
        }
    }
    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::files::InMemoryContextFileStore;
    use crate::store::AgentRecord;

    #[tokio::test]
    async fn user_seeding_is_idempotent() {
        let store: Arc<dyn ContextFileStore> = InMemoryContextFileStore::new();
        let agent = AgentRecord::test("a");
        let first = seed_user_files(&store, &agent, "u1").await.unwrap();
        assert_eq!(first, CONTEXT_FILES.len() + 1);
        let second = seed_user_files(&store, &agent, "u1").await.unwrap();
        assert_eq!(second, 0);
    }

    #[tokio::test]
    async fn predefined_agents_seed_shared_rows_once() {
        let store: Arc<dyn ContextFileStore> = InMemoryContextFileStore::new();
        let mut agent = AgentRecord::test("shared");
        agent.agent_type = AgentType::Predefined;

        let created = seed_agent_files(&store, &agent).await.unwrap();
        // Everything except the personalization file.
        assert_eq!(created, CONTEXT_FILES.len());
        assert_eq!(seed_agent_files(&store, &agent).await.unwrap(), 0);

        // The per-user pass provisions only USER.md.
        assert_eq!(seed_user_files(&store, &agent, "u1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn seeding_does_not_overwrite_user_content() {
        let store: Arc<dyn ContextFileStore> = InMemoryContextFileStore::new();
        let agent = AgentRecord::test("a");
        store
            .put_user_file(&agent.id, "u1", "SOUL.md", "customized")
            .await
            .unwrap();
        seed_user_files(&store, &agent, "u1").await.unwrap();
        assert_eq!(
            store
                .get_user_file(&agent.id, "u1", "SOUL.md")
                .await
                .unwrap()
                .as_deref(),
            Some("customized")
        );
    }

    #[test]
    fn every_recognized_file_has_a_template() {
        for name in CONTEXT_FILES.iter().chain([MEMORY_INDEX].iter()).copied() {
            assert!(template_for(name).is_some(), "missing template: {}", name);
        }
        assert!(template_for("README.md").is_none());
    }
}
