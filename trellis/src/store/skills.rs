//! Skill store: named capabilities with embedding search, feeding the
//! skills-summary section of the system prompt.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::memory::{cosine_similarity, Embedder};
use super::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub body: String,
    /// Agent key this skill belongs to; empty means shared.
    #[serde(default)]
    pub agent_key: String,
}

#[async_trait]
pub trait SkillStore: Send + Sync {
    async fn put(&self, skill: &Skill) -> Result<(), StoreError>;
    async fn delete(&self, name: &str) -> Result<(), StoreError>;
    async fn list_for(&self, agent_key: &str) -> Result<Vec<Skill>, StoreError>;
    /// Top skills for `query` by semantic similarity over name+description.
    async fn search(
        &self,
        agent_key: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Skill>, StoreError>;
}

struct IndexedSkill {
    skill: Skill,
    vector: Vec<f32>,
}

pub struct InMemorySkillStore {
    embedder: Arc<dyn Embedder>,
    skills: DashMap<String, IndexedSkill>,
}

impl InMemorySkillStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Arc<Self> {
        Arc::new(Self {
            embedder,
            skills: DashMap::new(),
        })
    }

    fn visible_to(skill: &Skill, agent_key: &str) -> bool {
        skill.agent_key.is_empty() || skill.agent_key == agent_key
    }
}

#[async_trait]
impl SkillStore for InMemorySkillStore {
    async fn put(&self, skill: &Skill) -> Result<(), StoreError> {
        let text = format!("{}: {}", skill.name, skill.description);
        let vector = self
            .embedder
            .embed(&[&text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Embedding("empty embedding response".into()))?;
        self.skills.insert(
            skill.name.clone(),
            IndexedSkill {
                skill: skill.clone(),
                vector,
            },
        );
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.skills.remove(name);
        Ok(())
    }

    async fn list_for(&self, agent_key: &str) -> Result<Vec<Skill>, StoreError> {
        let mut out: Vec<Skill> = self
            .skills
            .iter()
            .filter(|e| Self::visible_to(&e.skill, agent_key))
            .map(|e| e.skill.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn search(
        &self,
        agent_key: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Skill>, StoreError> {
        let query_vec = self
            .embedder
            .embed(&[query])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Embedding("empty embedding response".into()))?;
        let mut scored: Vec<(f32, Skill)> = self
            .skills
            .iter()
            .filter(|e| Self::visible_to(&e.skill, agent_key))
            .map(|e| (cosine_similarity(&query_vec, &e.vector), e.skill.clone()))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored.into_iter().take(limit).map(|(_, s)| s).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::HashEmbedder;

    #[tokio::test]
    async fn shared_and_scoped_skills_visibility() {
        let store = InMemorySkillStore::new(Arc::new(HashEmbedder::default()));
        store
            .put(&Skill {
                name: "summarize".into(),
                description: "Summarize documents".into(),
                body: String::new(),
                agent_key: String::new(),
            })
            .await
            .unwrap();
        store
            .put(&Skill {
                name: "deploy".into(),
                description: "Deploy the service".into(),
                body: String::new(),
                agent_key: "ops".into(),
            })
            .await
            .unwrap();

        assert_eq!(store.list_for("ops").await.unwrap().len(), 2);
        assert_eq!(store.list_for("other").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn search_ranks_by_similarity() {
        let store = InMemorySkillStore::new(Arc::new(HashEmbedder::default()));
        for (name, desc) in [
            ("summarize", "Summarize long documents into short notes"),
            ("weather", "Fetch the weather forecast"),
        ] {
            store
                .put(&Skill {
                    name: name.into(),
                    description: desc.into(),
                    body: String::new(),
                    agent_key: String::new(),
                })
                .await
                .unwrap();
        }
        let hits = store
            .search("any", "summarize a long document", 1)
            .await
            .unwrap();
        assert_eq!(hits[0].name, "summarize");
    }
}
