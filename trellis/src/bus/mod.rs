//! Process-wide message bus: inbound fan-in and domain-event fan-out.
//!
//! Channel adapters, cron triggers, and announce producers publish
//! [`InboundMessage`]s; the gateway dispatcher consumes them with worker-pool
//! semantics (each message goes to exactly one consumer). Domain events are
//! broadcast to all subscribers; slow subscribers may miss events but never
//! block a publisher.
//!
//! **Interaction**: the dispatcher holds the single inbound receiver; the
//! subagent and delegate managers publish announces here instead of calling
//! back into the loop, so message passing is the only coupling between
//! background tasks and caller sessions.

mod event;

pub use event::{BusEvent, CacheDomain, RunPhase};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Mutex};

/// Kind of peer a message originates from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerKind {
    Direct,
    Group,
}

impl PeerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PeerKind::Direct => "direct",
            PeerKind::Group => "group",
        }
    }
}

impl std::str::FromStr for PeerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(PeerKind::Direct),
            "group" => Ok(PeerKind::Group),
            other => Err(format!("unknown peer kind: {}", other)),
        }
    }
}

/// One message entering the gateway: from a channel adapter, a cron trigger,
/// or a subagent/delegation announce.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Channel name ("telegram", "websocket", "system", "cron").
    pub channel: String,
    /// Sender id within the channel; announces use `subagent:{id}` or
    /// `delegate:{id}`.
    pub sender_id: String,
    /// Chat id within the channel; the peer component of the session key.
    pub chat_id: String,
    pub peer_kind: PeerKind,
    pub content: String,
    /// Opaque identity from the trusted upstream.
    pub user_id: String,
    /// Set when a specific agent is addressed; empty means default agent.
    pub agent_key: String,
    /// Free-form metadata: `command`, announce origin keys, trace links.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Returns the `command` metadata value, if any (`reset`, `stop`, `stopall`).
    pub fn command(&self) -> Option<&str> {
        self.metadata.get("command").map(String::as_str)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Bounded inbound queue plus domain-event broadcast.
///
/// `publish_inbound` is non-blocking: when the queue is full the oldest
/// message is dropped and the drop counter increments. The receiver side is
/// a single shared handle; `next_inbound` delivers each message to exactly
/// one caller.
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    events: broadcast::Sender<BusEvent>,
    dropped: AtomicU64,
}

/// Default inbound queue capacity.
pub const DEFAULT_INBOUND_CAPACITY: usize = 1024;

/// Broadcast ring size for domain events.
const EVENT_CAPACITY: usize = 256;

impl MessageBus {
    pub fn new(inbound_capacity: usize) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Arc::new(Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            events,
            dropped: AtomicU64::new(0),
        })
    }

    /// Publishes an inbound message without blocking. On a full queue the
    /// oldest queued message is evicted to make room.
    pub async fn publish_inbound(&self, message: InboundMessage) {
        let mut pending = message;
        loop {
            match self.inbound_tx.try_send(pending) {
                Ok(()) => return,
                Err(mpsc::error::TrySendError::Full(back)) => {
                    // Evict the oldest item, then retry once with the same
                    // message; a racing consumer may have drained instead,
                    // which is fine.
                    let evicted = self.inbound_rx.lock().await.try_recv().ok();
                    if evicted.is_some() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            dropped = self.dropped.load(Ordering::Relaxed),
                            "inbound queue full; dropped oldest message"
                        );
                    }
                    pending = back;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::warn!("inbound queue closed; message discarded");
                    return;
                }
            }
        }
    }

    /// Receives the next inbound message. Each message is delivered to
    /// exactly one caller. Returns `None` after shutdown.
    pub async fn next_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Number of messages evicted because the inbound queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Broadcasts a domain event to all current subscribers. Never blocks;
    /// the send result (no subscribers) is intentionally ignored.
    pub fn broadcast(&self, event: BusEvent) {
        let _ = self.events.send(event);
    }

    /// Subscribes to the domain-event stream. A lagged subscriber misses
    /// events rather than slowing publishers down.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.events.subscribe()
    }
}
