//! Sessions: the per-(agent, channel, peer) message log with token
//! accounting and an optional summarization string.
//!
//! A session is exclusively mutated by the run currently serialized on its
//! key; group chats relax serialization and use [`SessionBuffer`] to keep
//! concurrent runs isolated until an atomic flush.

mod buffer;
mod store;

pub use buffer::SessionBuffer;
pub use store::{InMemorySessionStore, SessionStore, SqliteSessionStore};

use serde::{Deserialize, Serialize};

use crate::bus::PeerKind;
use crate::message::{Message, Role};

/// Default per-chat concurrency hint for group sessions.
pub const DEFAULT_GROUP_CONCURRENCY: usize = 3;

/// Strictly parseable session key: `agent:{agentId}:{channel}:{peerKind}:{peerId}`.
///
/// Colons are forbidden inside inner components; [`SessionKey::parse`]
/// rejects malformed keys rather than guessing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub agent_id: String,
    pub channel: String,
    pub peer_kind: PeerKind,
    pub peer_id: String,
}

impl SessionKey {
    pub fn new(
        agent_id: impl Into<String>,
        channel: impl Into<String>,
        peer_kind: PeerKind,
        peer_id: impl Into<String>,
    ) -> Result<Self, SessionKeyError> {
        let key = Self {
            agent_id: agent_id.into(),
            channel: channel.into(),
            peer_kind,
            peer_id: peer_id.into(),
        };
        for part in [&key.agent_id, &key.channel, &key.peer_id] {
            if part.is_empty() {
                return Err(SessionKeyError::EmptyComponent);
            }
            if part.contains(':') {
                return Err(SessionKeyError::ColonInComponent(part.clone()));
            }
        }
        Ok(key)
    }

    pub fn parse(s: &str) -> Result<Self, SessionKeyError> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            ["agent", agent_id, channel, peer_kind, peer_id] => {
                let peer_kind = peer_kind
                    .parse::<PeerKind>()
                    .map_err(|_| SessionKeyError::BadPeerKind(peer_kind.to_string()))?;
                Self::new(*agent_id, *channel, peer_kind, *peer_id)
            }
            _ => Err(SessionKeyError::BadShape(s.to_string())),
        }
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "agent:{}:{}:{}:{}",
            self.agent_id,
            self.channel,
            self.peer_kind.as_str(),
            self.peer_id
        )
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SessionKeyError {
    #[error("session key must be agent:{{id}}:{{channel}}:{{peerKind}}:{{peerId}}: {0}")]
    BadShape(String),
    #[error("unknown peer kind: {0}")]
    BadPeerKind(String),
    #[error("colon inside session key component: {0}")]
    ColonInComponent(String),
    #[error("empty session key component")]
    EmptyComponent,
}

/// Accumulated token counters for a session.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenCounters {
    pub prompt: u64,
    pub completion: u64,
    /// Estimate of tokens currently held by the message log; compaction
    /// compares this against the context-window budget.
    pub accumulated: u32,
}

/// The mutable per-session state: ordered log, summary, counters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Session {
    pub messages: Vec<Message>,
    /// Rolling summary produced by compaction; embedded into the regenerated
    /// system message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default)]
    pub tokens: TokenCounters,
    /// Group chats only: how many concurrent runs this session tolerates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_concurrency: Option<usize>,
}

impl Session {
    /// Seeds or replaces the leading system message. The first system
    /// message is regenerated in place, never appended.
    pub fn set_system(&mut self, content: impl Into<String>) {
        let content = content.into();
        match self.messages.first_mut() {
            Some(first) if first.role == Role::System => first.content = content,
            _ => self.messages.insert(0, Message::system(content)),
        }
    }

    pub fn push(&mut self, message: Message) {
        self.tokens.accumulated = self
            .tokens
            .accumulated
            .saturating_add(message.estimate_tokens());
        self.messages.push(message);
    }

    /// Recomputes `accumulated` from scratch; used after compaction rewrote
    /// the log wholesale.
    pub fn recount_tokens(&mut self) {
        self.tokens.accumulated = self.messages.iter().map(Message::estimate_tokens).sum();
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
    }
}
