//! Embedding-backed memory store: chunk → embed → index, with cosine
//! search over stored vectors.
//!
//! The interceptor feeds markdown writes through [`chunk_markdown`] and puts
//! each chunk; searches embed the query and rank by cosine similarity.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::StoreError;

/// Produces fixed-size float vectors from text.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// One vector per input text, in order.
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError>;

    fn dimension(&self) -> usize;
}

/// Deterministic, dependency-free embedder for tests: hashes character
/// trigrams into a fixed-size bag. Similar texts land near each other; that
/// is all the tests need.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(128)
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0f32; self.dimension];
                let chars: Vec<char> = text.to_lowercase().chars().collect();
                for window in chars.windows(3) {
                    let mut hash: u64 = 1469598103934665603;
                    for c in window {
                        hash ^= *c as u64;
                        hash = hash.wrapping_mul(1099511628211);
                    }
                    v[(hash % self.dimension as u64) as usize] += 1.0;
                }
                let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
                if norm > 0.0 {
                    for x in &mut v {
                        *x /= norm;
                    }
                }
                v
            })
            .collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// OpenAI embeddings client.
pub struct OpenAiEmbedder {
    config: async_openai::config::OpenAIConfig,
    model: String,
    dimensions: usize,
}

impl OpenAiEmbedder {
    pub fn new(model: impl Into<String>) -> Self {
        Self::with_config(async_openai::config::OpenAIConfig::new(), model)
    }

    pub fn with_config(
        config: async_openai::config::OpenAIConfig,
        model: impl Into<String>,
    ) -> Self {
        let model = model.into();
        let dimensions = match model.as_str() {
            "text-embedding-3-large" => 3072,
            _ => 1536,
        };
        Self {
            config,
            model,
            dimensions,
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, StoreError> {
        use async_openai::types::embeddings::{CreateEmbeddingRequest, EmbeddingInput};
        let mut inputs: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        let input = if inputs.len() == 1 {
            EmbeddingInput::String(inputs.remove(0))
        } else {
            EmbeddingInput::StringArray(inputs)
        };
        let client = async_openai::Client::with_config(self.config.clone());
        let response = client
            .embeddings()
            .create(CreateEmbeddingRequest {
                input,
                model: self.model.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| StoreError::Embedding(e.to_string()))?;
        Ok(response.data.into_iter().map(|e| e.embedding).collect())
    }

    fn dimension(&self) -> usize {
        self.dimensions
    }
}

/// Which agent/user pair a memory belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryScope {
    pub agent_id: String,
    /// Empty for agent-level memories.
    pub user_id: String,
}

/// One indexed memory chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub scope: MemoryScope,
    /// Source path under the workspace (`memory/2026-05.md` etc.).
    pub path: String,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Clone, Debug)]
pub struct MemorySearchHit {
    pub record: MemoryRecord,
    pub score: f32,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Indexes `text` chunks under `path`, replacing prior chunks for the
    /// same (scope, path).
    async fn index(
        &self,
        scope: &MemoryScope,
        path: &str,
        chunks: &[String],
    ) -> Result<usize, StoreError>;

    async fn search(
        &self,
        scope: &MemoryScope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemorySearchHit>, StoreError>;

    async fn get(&self, scope: &MemoryScope, id: &str) -> Result<Option<MemoryRecord>, StoreError>;

    async fn delete_path(&self, scope: &MemoryScope, path: &str) -> Result<usize, StoreError>;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Splits markdown into chunks by heading/blank-line boundaries, capped at
/// `max_chars` per chunk.
pub fn chunk_markdown(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(64);
    let mut chunks = Vec::new();
    let mut current = String::new();
    for block in text.split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let starts_section = block.starts_with('#');
        if !current.is_empty() && (starts_section || current.len() + block.len() + 2 > max_chars) {
            chunks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push_str("\n\n");
        }
        current.push_str(block);
        // A single oversized block is split hard.
        while current.len() > max_chars {
            let cut = current
                .char_indices()
                .take_while(|(i, _)| *i < max_chars)
                .last()
                .map(|(i, c)| i + c.len_utf8())
                .unwrap_or(current.len());
            let rest = current.split_off(cut);
            chunks.push(std::mem::take(&mut current));
            current = rest;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct IndexedRecord {
    record: MemoryRecord,
    vector: Vec<f32>,
}

/// In-process vector store; cosine scoring over all records in scope.
pub struct InMemoryMemoryStore {
    embedder: Arc<dyn Embedder>,
    records: DashMap<String, IndexedRecord>,
}

impl InMemoryMemoryStore {
    pub fn new(embedder: Arc<dyn Embedder>) -> Arc<Self> {
        Arc::new(Self {
            embedder,
            records: DashMap::new(),
        })
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn index(
        &self,
        scope: &MemoryScope,
        path: &str,
        chunks: &[String],
    ) -> Result<usize, StoreError> {
        self.delete_path(scope, path).await?;
        if chunks.is_empty() {
            return Ok(0);
        }
        let texts: Vec<&str> = chunks.iter().map(String::as_str).collect();
        let vectors = self.embedder.embed(&texts).await?;
        for (chunk, vector) in chunks.iter().zip(vectors) {
            let record = MemoryRecord {
                id: uuid::Uuid::new_v4().to_string(),
                scope: scope.clone(),
                path: path.to_string(),
                text: chunk.clone(),
                created_at: chrono::Utc::now(),
            };
            self.records
                .insert(record.id.clone(), IndexedRecord { record, vector });
        }
        Ok(chunks.len())
    }

    async fn search(
        &self,
        scope: &MemoryScope,
        query: &str,
        limit: usize,
    ) -> Result<Vec<MemorySearchHit>, StoreError> {
        let query_vec = self
            .embedder
            .embed(&[query])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::Embedding("empty embedding response".into()))?;
        let mut hits: Vec<MemorySearchHit> = self
            .records
            .iter()
            .filter(|e| &e.record.scope == scope)
            .map(|e| MemorySearchHit {
                record: e.record.clone(),
                score: cosine_similarity(&query_vec, &e.vector),
            })
            .collect();
        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn get(&self, scope: &MemoryScope, id: &str) -> Result<Option<MemoryRecord>, StoreError> {
        Ok(self
            .records
            .get(id)
            .filter(|e| &e.record.scope == scope)
            .map(|e| e.record.clone()))
    }

    async fn delete_path(&self, scope: &MemoryScope, path: &str) -> Result<usize, StoreError> {
        let doomed: Vec<String> = self
            .records
            .iter()
            .filter(|e| &e.record.scope == scope && e.record.path == path)
            .map(|e| e.key().clone())
            .collect();
        let count = doomed.len();
        for id in doomed {
            self.records.remove(&id);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> MemoryScope {
        MemoryScope {
            agent_id: "a1".into(),
            user_id: "u1".into(),
        }
    }

    #[tokio::test]
    async fn index_and_search_ranks_relevant_chunks_first() {
        let store = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        store
            .index(
                &scope(),
                "memory/notes.md",
                &[
                    "The user prefers rust and systems programming".to_string(),
                    "Grocery list: apples, bananas, oat milk".to_string(),
                ],
            )
            .await
            .unwrap();

        let hits = store
            .search(&scope(), "what programming language does the user like", 2)
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].record.text.contains("rust"));
        assert!(hits[0].score >= hits[1].score);
    }

    #[tokio::test]
    async fn reindexing_a_path_replaces_old_chunks() {
        let store = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        store
            .index(&scope(), "memory/a.md", &["old fact".to_string()])
            .await
            .unwrap();
        store
            .index(&scope(), "memory/a.md", &["new fact".to_string()])
            .await
            .unwrap();
        let hits = store.search(&scope(), "fact", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.text, "new fact");
    }

    #[tokio::test]
    async fn scopes_are_isolated() {
        let store = InMemoryMemoryStore::new(Arc::new(HashEmbedder::default()));
        store
            .index(&scope(), "memory/a.md", &["private note".to_string()])
            .await
            .unwrap();
        let other = MemoryScope {
            agent_id: "a1".into(),
            user_id: "u2".into(),
        };
        assert!(store.search(&other, "private", 5).await.unwrap().is_empty());
    }

    #[test]
    fn chunking_splits_on_headings_and_caps_size() {
        let text = "# One\n\nbody one\n\n# Two\n\nbody two";
        let chunks = chunk_markdown(text, 1000);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("# One"));

        let long = "x".repeat(500);
        let chunks = chunk_markdown(&long, 100);
        assert!(chunks.len() >= 5);
        assert!(chunks.iter().all(|c| c.len() <= 100));
    }

    #[test]
    fn cosine_basics() {
        assert!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) > 0.99);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }
}
