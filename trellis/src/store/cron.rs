//! Cron jobs: fixed-interval messages published into the inbound queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::StoreError;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CronJob {
    pub id: String,
    pub agent_key: String,
    /// Fixed interval between firings.
    pub interval_secs: u64,
    /// Message text delivered as the inbound content.
    pub message: String,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_fired_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl CronJob {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    /// Whether the job is due at `now`.
    pub fn is_due(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_fired_at {
            None => true,
            Some(last) => now.signed_duration_since(last).num_seconds() >= self.interval_secs as i64,
        }
    }
}

#[async_trait]
pub trait CronStore: Send + Sync {
    async fn put(&self, job: &CronJob) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<CronJob>, StoreError>;
    async fn mark_fired(
        &self,
        id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryCronStore {
    jobs: DashMap<String, CronJob>,
}

impl InMemoryCronStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl CronStore for InMemoryCronStore {
    async fn put(&self, job: &CronJob) -> Result<(), StoreError> {
        self.jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.jobs.remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<CronJob>, StoreError> {
        Ok(self.jobs.iter().map(|j| j.clone()).collect())
    }

    async fn mark_fired(
        &self,
        id: &str,
        at: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), StoreError> {
        match self.jobs.get_mut(id) {
            Some(mut job) => {
                job.last_fired_at = Some(at);
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("cron job {}", id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn due_logic_respects_interval_and_enabled() {
        let now = chrono::Utc::now();
        let mut job = CronJob {
            id: "j1".into(),
            agent_key: "a".into(),
            interval_secs: 60,
            message: "tick".into(),
            enabled: true,
            last_fired_at: None,
        };
        assert!(job.is_due(now));
        job.last_fired_at = Some(now - chrono::Duration::seconds(30));
        assert!(!job.is_due(now));
        job.last_fired_at = Some(now - chrono::Duration::seconds(90));
        assert!(job.is_due(now));
        job.enabled = false;
        assert!(!job.is_due(now));
    }

    #[tokio::test]
    async fn mark_fired_updates_timestamp() {
        let store = InMemoryCronStore::default();
        let job = CronJob {
            id: "j1".into(),
            agent_key: "a".into(),
            interval_secs: 60,
            message: "tick".into(),
            enabled: true,
            last_fired_at: None,
        };
        store.put(&job).await.unwrap();
        let now = chrono::Utc::now();
        store.mark_fired("j1", now).await.unwrap();
        let loaded = store.list().await.unwrap();
        assert_eq!(loaded[0].last_fired_at, Some(now));
    }
}
