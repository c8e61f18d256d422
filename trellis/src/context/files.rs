//! Context-file storage and the interceptors routing file-tool traffic.
//!
//! Seven recognized filenames (plus the `MEMORY.md` index) are virtual:
//! reads and writes are routed to agent-scope or (agent, user)-scope rows
//! instead of the workspace filesystem. `open` agents keep every file
//! per-user with agent-level templates as fallback; `predefined` agents
//! share everything except the personalization file.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::store::{
    chunk_markdown, AgentRecord, AgentType, MemoryScope, MemoryStore, StoreError,
};

/// The recognized context-file set, in prompt order.
pub const CONTEXT_FILES: &[&str] = &[
    "AGENTS.md",
    "SOUL.md",
    "TOOLS.md",
    "IDENTITY.md",
    "USER.md",
    "HEARTBEAT.md",
    "BOOTSTRAP.md",
];

/// The memory index file at the workspace root.
pub const MEMORY_INDEX: &str = "MEMORY.md";

/// The one per-user file of `predefined` agents.
pub const PERSONALIZATION_FILE: &str = "USER.md";

/// Whether `name` is one of the intercepted context filenames.
pub fn is_context_file(name: &str) -> bool {
    CONTEXT_FILES.contains(&name)
}

/// Row storage for context files at agent scope and (agent, user) scope.
#[async_trait]
pub trait ContextFileStore: Send + Sync {
    async fn get_agent_file(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn put_agent_file(
        &self,
        agent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn get_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn put_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError>;

    async fn delete_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<(), StoreError>;

    /// Atomic exclusive create: writes only when the row is absent.
    /// Returns true when this call created the row.
    async fn create_user_file_if_absent(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<bool, StoreError>;

    /// Exclusive create at agent scope.
    async fn create_agent_file_if_absent(
        &self,
        agent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<bool, StoreError>;
}

#[derive(Default)]
pub struct InMemoryContextFileStore {
    agent_files: DashMap<(String, String), String>,
    user_files: DashMap<(String, String, String), String>,
}

impl InMemoryContextFileStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ContextFileStore for InMemoryContextFileStore {
    async fn get_agent_file(
        &self,
        agent_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .agent_files
            .get(&(agent_id.to_string(), name.to_string()))
            .map(|v| v.clone()))
    }

    async fn put_agent_file(
        &self,
        agent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.agent_files.insert(
            (agent_id.to_string(), name.to_string()),
            content.to_string(),
        );
        Ok(())
    }

    async fn get_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        Ok(self
            .user_files
            .get(&(
                agent_id.to_string(),
                user_id.to_string(),
                name.to_string(),
            ))
            .map(|v| v.clone()))
    }

    async fn put_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        self.user_files.insert(
            (
                agent_id.to_string(),
                user_id.to_string(),
                name.to_string(),
            ),
            content.to_string(),
        );
        Ok(())
    }

    async fn delete_user_file(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<(), StoreError> {
        self.user_files.remove(&(
            agent_id.to_string(),
            user_id.to_string(),
            name.to_string(),
        ));
        Ok(())
    }

    async fn create_user_file_if_absent(
        &self,
        agent_id: &str,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<bool, StoreError> {
        match self.user_files.entry((
            agent_id.to_string(),
            user_id.to_string(),
            name.to_string(),
        )) {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(content.to_string());
                Ok(true)
            }
        }
    }

    async fn create_agent_file_if_absent(
        &self,
        agent_id: &str,
        name: &str,
        content: &str,
    ) -> Result<bool, StoreError> {
        match self
            .agent_files
            .entry((agent_id.to_string(), name.to_string()))
        {
            dashmap::mapref::entry::Entry::Occupied(_) => Ok(false),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(content.to_string());
                Ok(true)
            }
        }
    }
}

/// Routes reads and writes of the recognized filenames to the right scope.
pub struct ContextFileInterceptor {
    store: Arc<dyn ContextFileStore>,
}

impl ContextFileInterceptor {
    pub fn new(store: Arc<dyn ContextFileStore>) -> Self {
        Self { store }
    }

    fn is_per_user(agent: &AgentRecord, name: &str) -> bool {
        match agent.agent_type {
            AgentType::Open => true,
            AgentType::Predefined => name == PERSONALIZATION_FILE,
        }
    }

    /// Reads `name` for (agent, user). Per-user files fall back to the
    /// agent-level template row when the user row is absent.
    pub async fn read(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        name: &str,
    ) -> Result<Option<String>, StoreError> {
        if Self::is_per_user(agent, name) {
            if let Some(content) = self.store.get_user_file(&agent.id, user_id, name).await? {
                return Ok(Some(content));
            }
        }
        self.store.get_agent_file(&agent.id, name).await
    }

    /// Writes `name` for (agent, user). An empty write to `BOOTSTRAP.md`
    /// deletes the per-user row: the first-run ritual is complete.
    pub async fn write(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        name: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        if name == "BOOTSTRAP.md" && content.trim().is_empty() {
            return self.store.delete_user_file(&agent.id, user_id, name).await;
        }
        if Self::is_per_user(agent, name) {
            self.store
                .put_user_file(&agent.id, user_id, name, content)
                .await
        } else {
            self.store.put_agent_file(&agent.id, name, content).await
        }
    }
}

/// Intercepts the `MEMORY.md` index and everything under `memory/`;
/// markdown writes feed the chunk → embed → index pipeline asynchronously.
pub struct MemoryInterceptor {
    files: Arc<dyn ContextFileStore>,
    memory: Arc<dyn MemoryStore>,
    /// Per-chunk character cap for indexing.
    chunk_chars: usize,
}

impl MemoryInterceptor {
    pub fn new(files: Arc<dyn ContextFileStore>, memory: Arc<dyn MemoryStore>) -> Self {
        Self {
            files,
            memory,
            chunk_chars: 1200,
        }
    }

    /// Whether `path` (workspace-relative) belongs to this interceptor.
    pub fn intercepts(path: &str) -> bool {
        let path = path.trim_start_matches("./");
        path == MEMORY_INDEX || path.starts_with("memory/")
    }

    pub async fn read(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        path: &str,
    ) -> Result<Option<String>, StoreError> {
        self.files
            .get_user_file(&agent.id, user_id, path.trim_start_matches("./"))
            .await
    }

    /// Writes the file row, then kicks off indexing for `.md` content. The
    /// indexing task runs detached: the write returns without waiting for
    /// embeddings.
    pub async fn write(
        &self,
        agent: &AgentRecord,
        user_id: &str,
        path: &str,
        content: &str,
    ) -> Result<(), StoreError> {
        let path = path.trim_start_matches("./").to_string();
        self.files
            .put_user_file(&agent.id, user_id, &path, content)
            .await?;

        if path.ends_with(".md") {
            let memory = Arc::clone(&self.memory);
            let scope = MemoryScope {
                agent_id: agent.id.clone(),
                user_id: user_id.to_string(),
            };
            let chunks = chunk_markdown(content, self.chunk_chars);
            tokio::spawn(async move {
                if let Err(e) = memory.index(&scope, &path, &chunks).await {
                    tracing::warn!(error = %e, path = %path, "memory indexing failed");
                }
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HashEmbedder, InMemoryMemoryStore};

    fn open_agent() -> AgentRecord {
        AgentRecord::test("open-agent")
    }

    fn predefined_agent() -> AgentRecord {
        let mut a = AgentRecord::test("shared-agent");
        a.agent_type = AgentType::Predefined;
        a
    }

    #[tokio::test]
    async fn open_agent_files_are_per_user_with_template_fallback() {
        let store = InMemoryContextFileStore::new();
        let interceptor = ContextFileInterceptor::new(store.clone());
        let agent = open_agent();

        store
            .put_agent_file(&agent.id, "SOUL.md", "template soul")
            .await
            .unwrap();

        // Fallback before any user write.
        assert_eq!(
            interceptor.read(&agent, "u1", "SOUL.md").await.unwrap(),
            Some("template soul".into())
        );

        interceptor
            .write(&agent, "u1", "SOUL.md", "personal soul")
            .await
            .unwrap();
        assert_eq!(
            interceptor.read(&agent, "u1", "SOUL.md").await.unwrap(),
            Some("personal soul".into())
        );
        // Other users still see the template.
        assert_eq!(
            interceptor.read(&agent, "u2", "SOUL.md").await.unwrap(),
            Some("template soul".into())
        );
    }

    #[tokio::test]
    async fn predefined_agent_shares_all_but_personalization() {
        let store = InMemoryContextFileStore::new();
        let interceptor = ContextFileInterceptor::new(store.clone());
        let agent = predefined_agent();

        interceptor
            .write(&agent, "u1", "SOUL.md", "shared soul")
            .await
            .unwrap();
        // Written at agent level, visible to every user.
        assert_eq!(
            interceptor.read(&agent, "u2", "SOUL.md").await.unwrap(),
            Some("shared soul".into())
        );

        interceptor
            .write(&agent, "u1", "USER.md", "u1 profile")
            .await
            .unwrap();
        assert_eq!(
            interceptor.read(&agent, "u2", "USER.md").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn empty_bootstrap_write_deletes_user_row() {
        let store = InMemoryContextFileStore::new();
        let interceptor = ContextFileInterceptor::new(store.clone());
        let agent = open_agent();

        interceptor
            .write(&agent, "u1", "BOOTSTRAP.md", "first-run ritual")
            .await
            .unwrap();
        assert!(interceptor
            .read(&agent, "u1", "BOOTSTRAP.md")
            .await
            .unwrap()
            .is_some());

        interceptor
            .write(&agent, "u1", "BOOTSTRAP.md", "")
            .await
            .unwrap();
        assert!(interceptor
            .read(&agent, "u1", "BOOTSTRAP.md")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn memory_interceptor_indexes_markdown_writes() {
        let files = InMemoryContextFileStore::new();
        let memory = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        let interceptor = MemoryInterceptor::new(files, memory.clone());
        let agent = open_agent();

        interceptor
            .write(&agent, "u1", "memory/2026-08.md", "# Notes\n\nuser likes rust")
            .await
            .unwrap();
        // Indexing is detached; give it a beat.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let scope = MemoryScope {
            agent_id: agent.id.clone(),
            user_id: "u1".into(),
        };
        let hits = memory.search(&scope, "rust", 5).await.unwrap();
        assert!(!hits.is_empty());
    }

    #[test]
    fn path_interception_rules() {
        assert!(MemoryInterceptor::intercepts("MEMORY.md"));
        assert!(MemoryInterceptor::intercepts("memory/2026.md"));
        assert!(!MemoryInterceptor::intercepts("notes/MEMORY.md"));
        assert!(is_context_file("AGENTS.md"));
        assert!(!is_context_file("README.md"));
    }
}
