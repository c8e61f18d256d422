//! Session persistence: the operations the core consumes, with an in-memory
//! table for tests and a SQLite file for single-node deployments.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use rusqlite::params;

use super::Session;
use crate::store::StoreError;

/// Key-value session persistence. Keys are rendered session keys
/// (`agent:{id}:{channel}:{peerKind}:{peerId}`).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Session>, StoreError>;
    async fn put(&self, key: &str, session: &Session) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Process-local store for tests and ephemeral deployments.
#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, Session>,
}

impl InMemorySessionStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(key).map(|s| s.clone()))
    }

    async fn put(&self, key: &str, session: &Session) -> Result<(), StoreError> {
        self.sessions.insert(key.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.sessions.remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.sessions.iter().map(|e| e.key().clone()).collect())
    }
}

/// SQLite-backed store. One row per session; the log is a JSON payload.
/// Blocking rusqlite work runs on the blocking pool.
pub struct SqliteSessionStore {
    db_path: std::path::PathBuf,
}

impl SqliteSessionStore {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = rusqlite::Connection::open(&db_path)
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        conn.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                key TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
            [],
        )
        .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(Self { db_path })
    }
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    async fn get(&self, key: &str) -> Result<Option<Session>, StoreError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT payload FROM sessions WHERE key = ?1")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let payload: Option<String> = stmt
                .query_row(params![key], |row| row.get(0))
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(StoreError::Storage(other.to_string())),
                })?;
            match payload {
                Some(json) => serde_json::from_str(&json)
                    .map(Some)
                    .map_err(|e| StoreError::Serialization(e.to_string())),
                None => Ok(None),
            }
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn put(&self, key: &str, session: &Session) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        let payload = serde_json::to_string(session)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute(
                r#"
                INSERT OR REPLACE INTO sessions (key, payload, updated_at)
                VALUES (?1, ?2, ?3)
                "#,
                params![key, payload, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let db_path = self.db_path.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            conn.execute("DELETE FROM sessions WHERE key = ?1", params![key])
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&db_path)
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let mut stmt = conn
                .prepare("SELECT key FROM sessions ORDER BY key")
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            let keys = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| StoreError::Storage(e.to_string()))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| StoreError::Storage(e.to_string()))?;
            Ok(keys)
        })
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    async fn roundtrip(store: &dyn SessionStore) {
        let mut session = Session::default();
        session.set_system("sys");
        session.push(Message::user("hi"));
        store.put("agent:a:c:direct:p", &session).await.unwrap();

        let loaded = store.get("agent:a:c:direct:p").await.unwrap().unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content, "hi");

        assert_eq!(store.list_keys().await.unwrap().len(), 1);
        store.delete("agent:a:c:direct:p").await.unwrap();
        assert!(store.get("agent:a:c:direct:p").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn in_memory_roundtrip() {
        roundtrip(&InMemorySessionStore::default()).await;
    }

    #[tokio::test]
    async fn sqlite_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteSessionStore::new(dir.path().join("sessions.db")).unwrap();
        roundtrip(&store).await;
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = InMemorySessionStore::default();
        assert!(store.get("agent:x:c:direct:p").await.unwrap().is_none());
    }
}
