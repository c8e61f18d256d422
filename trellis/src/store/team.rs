//! External team-task store: the claim + complete surface the delegate
//! manager drives for task-graph auto-completion.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::StoreError;

#[async_trait]
pub trait TeamTaskStore: Send + Sync {
    /// Claims `task_id` for `agent_id`; fails if already claimed by another.
    async fn claim(&self, task_id: &str, agent_id: &str) -> Result<(), StoreError>;

    /// Marks a claimed task complete with its result text.
    async fn complete(&self, task_id: &str, result: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskState {
    Claimed { agent_id: String },
    Completed { result: String },
}

#[derive(Default)]
pub struct InMemoryTeamTaskStore {
    tasks: DashMap<String, TaskState>,
}

impl InMemoryTeamTaskStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn state(&self, task_id: &str) -> Option<TaskState> {
        self.tasks.get(task_id).map(|t| t.clone())
    }
}

#[async_trait]
impl TeamTaskStore for InMemoryTeamTaskStore {
    async fn claim(&self, task_id: &str, agent_id: &str) -> Result<(), StoreError> {
        match self.tasks.entry(task_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => match entry.get() {
                TaskState::Claimed { agent_id: owner } if owner == agent_id => Ok(()),
                _ => Err(StoreError::Conflict(format!(
                    "task {} already claimed",
                    task_id
                ))),
            },
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(TaskState::Claimed {
                    agent_id: agent_id.to_string(),
                });
                Ok(())
            }
        }
    }

    async fn complete(&self, task_id: &str, result: &str) -> Result<(), StoreError> {
        match self.tasks.get_mut(task_id) {
            Some(mut state) => {
                *state = TaskState::Completed {
                    result: result.to_string(),
                };
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("task {}", task_id))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_then_complete_round_trips() {
        let store = InMemoryTeamTaskStore::default();
        store.claim("t1", "agent-a").await.unwrap();
        assert!(store.claim("t1", "agent-b").await.is_err());
        // Re-claim by the same agent is idempotent.
        store.claim("t1", "agent-a").await.unwrap();
        store.complete("t1", "done").await.unwrap();
        assert_eq!(
            store.state("t1"),
            Some(TaskState::Completed {
                result: "done".into()
            })
        );
    }
}
