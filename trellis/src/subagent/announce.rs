//! Announce coalescing.
//!
//! Multiple announces destined for the same parent session within a short
//! window merge into one inbound message, so a burst of finishing subagents
//! wakes the parent once instead of five times. With a zero window the
//! queue degenerates to direct publishing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::{InboundMessage, MessageBus};

struct PendingAnnounce {
    message: InboundMessage,
    flush_scheduled: bool,
}

/// Debounced per-session announce buffer.
pub struct AnnounceQueue {
    bus: Arc<MessageBus>,
    window: Duration,
    pending: Arc<Mutex<HashMap<String, PendingAnnounce>>>,
}

impl AnnounceQueue {
    pub fn new(bus: Arc<MessageBus>, window: Duration) -> Arc<Self> {
        Arc::new(Self {
            bus,
            window,
            pending: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Publishes `message`, coalescing with other announces for
    /// `session_key` that arrive within the window. Bodies concatenate in
    /// arrival order; metadata of the first announce wins.
    pub async fn publish(&self, session_key: &str, message: InboundMessage) {
        if self.window.is_zero() {
            self.bus.publish_inbound(message).await;
            return;
        }
        let schedule = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            match pending.get_mut(session_key) {
                Some(entry) => {
                    entry.message.content.push_str("\n\n");
                    entry.message.content.push_str(&message.content);
                    false
                }
                None => {
                    pending.insert(
                        session_key.to_string(),
                        PendingAnnounce {
                            message,
                            flush_scheduled: true,
                        },
                    );
                    true
                }
            }
        };
        if schedule {
            // The flush task owns only the shared state it needs, so it
            // outlives any particular handle to the queue.
            let bus = Arc::clone(&self.bus);
            let pending = Arc::clone(&self.pending);
            let window = self.window;
            let key = session_key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(window).await;
                let message = {
                    let mut pending = pending.lock().unwrap_or_else(|e| e.into_inner());
                    pending.remove(&key).map(|p| {
                        debug_assert!(p.flush_scheduled);
                        p.message
                    })
                };
                if let Some(message) = message {
                    bus.publish_inbound(message).await;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::PeerKind;

    fn announce(content: &str) -> InboundMessage {
        InboundMessage {
            channel: "system".into(),
            sender_id: "subagent:t1".into(),
            chat_id: "c1".into(),
            peer_kind: PeerKind::Direct,
            content: content.into(),
            user_id: "u1".into(),
            agent_key: String::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn zero_window_publishes_immediately() {
        let bus = MessageBus::new(8);
        let queue = AnnounceQueue::new(bus.clone(), Duration::ZERO);
        queue.publish("k", announce("done")).await;
        assert_eq!(bus.next_inbound().await.unwrap().content, "done");
    }

    #[tokio::test]
    async fn burst_coalesces_into_one_inbound() {
        let bus = MessageBus::new(8);
        let queue = AnnounceQueue::new(bus.clone(), Duration::from_millis(50));
        queue.publish("k", announce("first")).await;
        queue.publish("k", announce("second")).await;
        let merged = bus.next_inbound().await.unwrap();
        assert!(merged.content.contains("first"));
        assert!(merged.content.contains("second"));
        // Nothing else queued.
        tokio::select! {
            _ = bus.next_inbound() => panic!("unexpected second announce"),
            _ = tokio::time::sleep(Duration::from_millis(120)) => {}
        }
    }

    #[tokio::test]
    async fn different_sessions_do_not_coalesce() {
        let bus = MessageBus::new(8);
        let queue = AnnounceQueue::new(bus.clone(), Duration::from_millis(30));
        queue.publish("k1", announce("a")).await;
        queue.publish("k2", announce("b")).await;
        let first = bus.next_inbound().await.unwrap();
        let second = bus.next_inbound().await.unwrap();
        assert_ne!(first.content, second.content);
    }
}
