//! Wire protocol: JSON request/response envelopes over the WebSocket.

use serde::{Deserialize, Serialize};
use trellis::LaneStats;

/// One client → server request. `id` correlates responses and stream frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientRequest {
    /// Run a turn against an agent session.
    Run(RunParams),
    /// Delete a session's log.
    SessionReset {
        id: Option<String>,
        agent: String,
        chat_id: String,
    },
    /// Live lane statistics.
    LaneStats { id: Option<String> },
    Ping { id: Option<String> },
}

#[derive(Debug, Deserialize)]
pub struct RunParams {
    pub id: Option<String>,
    /// Agent key; empty selects the gateway default.
    #[serde(default)]
    pub agent: String,
    pub content: String,
    pub user_id: String,
    /// Conversation id within the websocket channel.
    pub chat_id: String,
    /// Forward incremental content frames before the final result.
    #[serde(default)]
    pub stream: bool,
}

/// One server → client message.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerResponse {
    /// Incremental content fragment for a streaming run.
    Chunk { id: Option<String>, content: String },
    RunResult {
        id: Option<String>,
        content: String,
        iterations: usize,
    },
    Ack { id: Option<String> },
    LaneStats {
        id: Option<String>,
        lanes: Vec<LaneStats>,
    },
    Pong { id: Option<String> },
    Error {
        id: Option<String>,
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_request_parses() {
        let json = r#"{"type":"run","id":"1","agent":"main","content":"hi","user_id":"u1","chat_id":"c1","stream":true}"#;
        match serde_json::from_str::<ClientRequest>(json).unwrap() {
            ClientRequest::Run(params) => {
                assert_eq!(params.agent, "main");
                assert!(params.stream);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn responses_serialize_with_type_tag() {
        let json = serde_json::to_value(ServerResponse::RunResult {
            id: Some("1".into()),
            content: "done".into(),
            iterations: 2,
        })
        .unwrap();
        assert_eq!(json["type"], "run_result");
        assert_eq!(json["iterations"], 2);
    }
}
