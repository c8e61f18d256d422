//! Per-session serialization and collision policy.
//!
//! Each session key admits at most one run at a time (group chats relax this
//! to a per-chat cap). When a message arrives for a busy session, the
//! configured [`QueueMode`] decides what happens: FIFO queueing with
//! debounce coalescing, merging into the in-flight run as a follow-up turn,
//! or cancelling the in-flight run and starting over.
//!
//! The dispatcher drives the protocol: `admit` to request a run slot,
//! `finish` to release it and collect the next queued batch, `cancel` /
//! `cancel_all` for stop commands.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bus::InboundMessage;

/// Collision policy for messages arriving while their session runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueMode {
    /// Enqueue FIFO up to capacity; bursts within the debounce window
    /// coalesce into one batch.
    Queue,
    /// Merge the new message into the in-flight run as a follow-up turn.
    Followup,
    /// Cancel the in-flight run, drain it, then start with the new message.
    Interrupt,
}

#[derive(Clone, Debug)]
pub struct SessionQueuesConfig {
    pub mode: QueueMode,
    /// Maximum queued batches per session.
    pub queue_capacity: usize,
    /// On overflow: drop the oldest batch (true) or reject the new message.
    pub drop_oldest_on_overflow: bool,
    /// Burst window: messages queued within this window of each other merge
    /// into one batch.
    pub debounce: Duration,
}

impl Default for SessionQueuesConfig {
    fn default() -> Self {
        Self {
            mode: QueueMode::Queue,
            queue_capacity: 16,
            drop_oldest_on_overflow: true,
            debounce: Duration::from_millis(800),
        }
    }
}

/// Outcome of [`SessionQueues::admit`].
pub enum Admission {
    /// A run slot was granted; run `message` now. Usually the caller's own
    /// message (possibly with superseded queue batches merged in); a batch
    /// stranded by a dropped guard takes priority, with the caller's message
    /// queued behind it.
    Start {
        message: InboundMessage,
        guard: SessionGuard,
    },
    /// The message was queued (or merged into a queued batch).
    Queued,
    /// The message was merged into the in-flight run as a follow-up turn.
    Merged,
    /// Queue overflow with reject policy.
    Rejected { reason: String },
}

struct RunSlot {
    run_id: String,
    cancel: CancellationToken,
}

struct PendingBatch {
    message: InboundMessage,
    last_arrival: Instant,
}

#[derive(Default)]
struct SessionState {
    running: Vec<RunSlot>,
    queue: VecDeque<PendingBatch>,
    followups: Arc<Mutex<Vec<String>>>,
    freed: Arc<Notify>,
}

/// Run-slot ownership for one admitted run.
///
/// Holds the per-run cancellation token and the follow-up buffer the loop
/// drains between iterations. The dispatcher must call
/// [`SessionQueues::finish`] with the guard when the run ends; dropping the
/// guard without `finish` releases the slot, and any queued batch is picked
/// up by the next admission.
pub struct SessionGuard {
    key: String,
    run_id: String,
    cancel: CancellationToken,
    followups: Arc<Mutex<Vec<String>>>,
    queues: Arc<Inner>,
    released: bool,
}

impl SessionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drains follow-up turns merged into this run so far.
    pub fn take_followups(&self) -> Vec<String> {
        match self.followups.lock() {
            Ok(mut f) => std::mem::take(&mut *f),
            Err(_) => Vec::new(),
        }
    }

    /// Owned drain closure, handed to the run so it can pick up follow-ups
    /// between iterations without borrowing the guard.
    pub fn followup_handle(&self) -> Arc<dyn Fn() -> Vec<String> + Send + Sync> {
        let followups = Arc::clone(&self.followups);
        Arc::new(move || match followups.lock() {
            Ok(mut f) => std::mem::take(&mut *f),
            Err(_) => Vec::new(),
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.released {
            self.queues.release_slot(&self.key, &self.run_id);
        }
    }
}

struct Inner {
    sessions: Mutex<HashMap<String, SessionState>>,
    config: SessionQueuesConfig,
}

impl Inner {
    fn release_slot(&self, key: &str, run_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(state) = sessions.get_mut(key) {
            state.running.retain(|s| s.run_id != run_id);
            state.freed.notify_waiters();
            if state.running.is_empty() && state.queue.is_empty() {
                sessions.remove(key);
            }
        }
    }
}

/// Per-session-key admission table.
pub struct SessionQueues {
    inner: Arc<Inner>,
}

impl SessionQueues {
    pub fn new(config: SessionQueuesConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Requests a run slot for `message` on `key`. `concurrency` is the
    /// effective per-session cap: 1 for direct chats, the group hint (or the
    /// adaptive reduction) for group chats.
    pub async fn admit(&self, key: &str, message: InboundMessage, concurrency: usize) -> Admission {
        self.admit_with_mode(key, message, concurrency, self.inner.config.mode)
            .await
    }

    /// Like [`admit`](Self::admit) with an explicit mode, letting command
    /// handling escalate a single message to `Interrupt` regardless of the
    /// configured policy. An interrupt arriving while queued batches wait
    /// supersedes them: their text becomes a prefix of the interrupting
    /// message.
    pub async fn admit_with_mode(
        &self,
        key: &str,
        mut message: InboundMessage,
        concurrency: usize,
        mode: QueueMode,
    ) -> Admission {
        let concurrency = concurrency.max(1);
        loop {
            let freed: Arc<Notify>;
            {
                let mut sessions = self
                    .inner
                    .sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let state = sessions.entry(key.to_string()).or_default();

                if state.running.len() < concurrency {
                    if let Some(batch) = state.queue.pop_front() {
                        // A guard was dropped without finish; the stranded
                        // batch goes first and the new message re-queues
                        // behind it.
                        let stranded = batch.message;
                        Self::enqueue(&self.inner.config, state, message);
                        let guard = Self::install_slot(&self.inner, key, state);
                        return Admission::Start {
                            message: stranded,
                            guard,
                        };
                    }
                    let guard = Self::install_slot(&self.inner, key, state);
                    return Admission::Start { message, guard };
                }

                match mode {
                    QueueMode::Followup => {
                        if let Ok(mut f) = state.followups.lock() {
                            f.push(message.content.clone());
                        }
                        return Admission::Merged;
                    }
                    QueueMode::Queue => {
                        return Self::enqueue(&self.inner.config, state, message);
                    }
                    QueueMode::Interrupt => {
                        let mut prefix = String::new();
                        for batch in state.queue.drain(..) {
                            prefix.push_str(&batch.message.content);
                            prefix.push('\n');
                        }
                        if !prefix.is_empty() {
                            message.content = format!("{}{}", prefix, message.content);
                        }
                        for slot in &state.running {
                            slot.cancel.cancel();
                        }
                        freed = Arc::clone(&state.freed);
                    }
                }
            }
            // Wait for the cancelled runs to drain; the timeout guards
            // against a notify racing the lock release.
            let _ = tokio::time::timeout(Duration::from_millis(100), freed.notified()).await;
        }
    }

    fn install_slot(inner: &Arc<Inner>, key: &str, state: &mut SessionState) -> SessionGuard {
        let run_id = uuid::Uuid::new_v4().to_string();
        let cancel = CancellationToken::new();
        state.running.push(RunSlot {
            run_id: run_id.clone(),
            cancel: cancel.clone(),
        });
        SessionGuard {
            key: key.to_string(),
            run_id,
            cancel,
            followups: Arc::clone(&state.followups),
            queues: Arc::clone(inner),
            released: false,
        }
    }

    fn enqueue(
        config: &SessionQueuesConfig,
        state: &mut SessionState,
        message: InboundMessage,
    ) -> Admission {
        let now = Instant::now();
        // Coalesce into the newest batch when within the debounce window.
        if let Some(last) = state.queue.back_mut() {
            if now.duration_since(last.last_arrival) <= config.debounce {
                last.message.content.push('\n');
                last.message.content.push_str(&message.content);
                last.last_arrival = now;
                return Admission::Queued;
            }
        }
        if state.queue.len() >= config.queue_capacity {
            if config.drop_oldest_on_overflow {
                state.queue.pop_front();
                tracing::warn!("session queue full; dropped oldest batch");
            } else {
                return Admission::Rejected {
                    reason: "session queue full".to_string(),
                };
            }
        }
        state.queue.push_back(PendingBatch {
            message,
            last_arrival: now,
        });
        Admission::Queued
    }

    /// Ends a run and hands over the next queued batch, if any.
    ///
    /// Keeps the slot reserved while waiting out an open debounce window so
    /// no concurrent admission can slip in between; returns the coalesced
    /// message together with a fresh guard for it.
    pub async fn finish(&self, mut guard: SessionGuard) -> Option<(InboundMessage, SessionGuard)> {
        guard.released = true;
        let key = guard.key.clone();
        let old_run_id = guard.run_id.clone();

        loop {
            let wait;
            {
                let mut sessions = self
                    .inner
                    .sessions
                    .lock()
                    .unwrap_or_else(|e| e.into_inner());
                let Some(state) = sessions.get_mut(&key) else {
                    return None;
                };
                match state.queue.front() {
                    None => {
                        state.running.retain(|s| s.run_id != old_run_id);
                        state.freed.notify_waiters();
                        if state.running.is_empty() {
                            sessions.remove(&key);
                        }
                        return None;
                    }
                    Some(front) => {
                        let since = Instant::now().duration_since(front.last_arrival);
                        if since >= self.inner.config.debounce {
                            if let Some(batch) = state.queue.pop_front() {
                                // Reuse the reserved slot under a new run id.
                                state.running.retain(|s| s.run_id != old_run_id);
                                let next = Self::install_slot(&self.inner, &key, state);
                                state.freed.notify_waiters();
                                return Some((batch.message, next));
                            }
                            continue;
                        }
                        wait = self.inner.config.debounce - since;
                    }
                }
            }
            tokio::time::sleep(wait).await;
        }
    }

    /// Cancels all running runs for `key` and clears its queue. Returns how
    /// many runs were signalled.
    pub fn cancel(&self, key: &str) -> usize {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        match sessions.get_mut(key) {
            Some(state) => {
                state.queue.clear();
                for slot in &state.running {
                    slot.cancel.cancel();
                }
                state.running.len()
            }
            None => 0,
        }
    }

    /// Cancels every running run in every session. Returns the count.
    pub fn cancel_all(&self) -> usize {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for state in sessions.values_mut() {
            state.queue.clear();
            for slot in &state.running {
                slot.cancel.cancel();
            }
            count += state.running.len();
        }
        count
    }

    /// Number of runs currently holding slots on `key`.
    pub fn running_count(&self, key: &str) -> usize {
        let sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        sessions.get(key).map(|s| s.running.len()).unwrap_or(0)
    }
}
