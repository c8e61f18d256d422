//! Local buffering for concurrent group-chat runs.
//!
//! A group session admits up to its concurrency hint in parallel runs, so a
//! run must not write the shared log while siblings execute. Each run works
//! on a [`SessionBuffer`]: a private copy that records how much of the log
//! it started from, then flushes only its own appends back through the store
//! in one put.

use super::{Session, SessionStore};
use crate::store::StoreError;

/// A run-private session copy with an atomic merge-back.
pub struct SessionBuffer {
    key: String,
    /// Length of the shared log when the run started; everything past this
    /// index in `working` is this run's own output.
    base_len: usize,
    working: Session,
}

impl SessionBuffer {
    pub fn new(key: impl Into<String>, snapshot: Session) -> Self {
        let base_len = snapshot.messages.len();
        Self {
            key: key.into(),
            base_len,
            working: snapshot,
        }
    }

    pub fn session(&self) -> &Session {
        &self.working
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.working
    }

    /// Messages appended by this run only.
    pub fn appended(&self) -> &[crate::message::Message] {
        &self.working.messages[self.base_len.min(self.working.messages.len())..]
    }

    /// Merges this run's appends into the current shared state and persists
    /// the result. Sibling runs that flushed earlier keep their messages;
    /// interleaving happens at flush granularity, never mid-run.
    ///
    /// A compaction rewrite (the log shrank below `base_len`) replaces the
    /// shared log wholesale instead of appending.
    pub async fn flush(self, store: &dyn SessionStore) -> Result<Session, StoreError> {
        let compacted = self.working.messages.len() < self.base_len;
        let merged = if compacted {
            self.working
        } else {
            let mut current = store.get(&self.key).await?.unwrap_or_default();
            let own: Vec<_> = self.working.messages[self.base_len..].to_vec();
            // The system message is regenerated each run; adopt this run's
            // version when the shared head is a system message too.
            if let (Some(shared_first), Some(own_first)) = (
                current.messages.first_mut(),
                self.working.messages.first(),
            ) {
                if shared_first.role == crate::message::Role::System
                    && own_first.role == crate::message::Role::System
                {
                    shared_first.content = own_first.content.clone();
                }
            }
            for message in own {
                current.messages.push(message);
            }
            current.summary = self.working.summary;
            current.tokens.prompt = current.tokens.prompt.max(self.working.tokens.prompt);
            current.tokens.completion =
                current.tokens.completion.max(self.working.tokens.completion);
            current.group_concurrency = self.working.group_concurrency;
            current.recount_tokens();
            current
        };
        store.put(&self.key, &merged).await?;
        Ok(merged)
    }
}
