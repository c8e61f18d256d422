//! Span persistence behind the operations the collector consumes.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use rusqlite::params;

use super::Span;
use crate::store::StoreError;

#[async_trait]
pub trait TracingStore: Send + Sync {
    async fn put_batch(&self, spans: &[Span]) -> Result<(), StoreError>;
    async fn list_by_trace(&self, trace_id: &str) -> Result<Vec<Span>, StoreError>;
}

/// Test/ephemeral store.
#[derive(Default)]
pub struct InMemoryTracingStore {
    spans: Mutex<Vec<Span>>,
}

#[async_trait]
impl TracingStore for InMemoryTracingStore {
    async fn put_batch(&self, spans: &[Span]) -> Result<(), StoreError> {
        self.spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(spans);
        Ok(())
    }

    async fn list_by_trace(&self, trace_id: &str) -> Result<Vec<Span>, StoreError> {
        Ok(self
            .spans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect())
    }
}

/// SQLite-backed span store; payload as JSON text.
pub struct SqliteTracingStore {
    db_path: std::path::PathBuf,
}

impl SqliteTracingStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS spans (
                span_id TEXT PRIMARY KEY,
                trace_id TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS spans_trace ON spans (trace_id)",
            [],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self { db_path })
    }
}

#[async_trait]
impl TracingStore for SqliteTracingStore {
    async fn put_batch(&self, spans: &[Span]) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let rows: Vec<(String, String, String)> = spans
            .iter()
            .map(|s| {
                serde_json::to_string(s)
                    .map(|json| (s.span_id.clone(), s.trace_id.clone(), json))
                    .map_err(|e| StoreError::Serialization(e.to_string()))
            })
            .collect::<Result<_, _>>()?;
        tokio::task::spawn_blocking(move || {
            let mut conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let tx = conn
                .transaction()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            for (span_id, trace_id, json) in rows {
                tx.execute(
                    "INSERT OR REPLACE INTO spans (span_id, trace_id, payload) VALUES (?1, ?2, ?3)",
                    params![span_id, trace_id, json],
                )
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            }
            tx.commit().map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn list_by_trace(&self, trace_id: &str) -> Result<Vec<Span>, StoreError> {
        let db_path = self.db_path.clone();
        let trace_id = trace_id.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT payload FROM spans WHERE trace_id = ?1")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let rows = stmt
                .query_map(params![trace_id], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            rows.into_iter()
                .map(|json| {
                    serde_json::from_str(&json)
                        .map_err(|e| StoreError::Serialization(e.to_string()))
                })
                .collect()
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::{SpanBuilder, SpanKind, SpanStatus, TraceContext};

    #[tokio::test]
    async fn sqlite_batch_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteTracingStore::new(dir.path().join("spans.db")).unwrap();
        let ctx = TraceContext::new_root();
        let spans = vec![
            SpanBuilder::start(&ctx, SpanKind::AgentRoot).finish(SpanStatus::Ok),
            SpanBuilder::start(&ctx, SpanKind::Llm).finish(SpanStatus::Error),
        ];
        store.put_batch(&spans).await.unwrap();
        let loaded = store.list_by_trace(&ctx.trace_id).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(store.list_by_trace("other").await.unwrap().is_empty());
    }
}
