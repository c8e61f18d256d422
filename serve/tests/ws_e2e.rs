//! End-to-end WebSocket tests: real server, real client socket.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use trellis::store::AgentStore;
use trellis::{AgentRecord, Gateway, ScriptedLlm, SessionStore};

async fn start_gateway(llm: ScriptedLlm) -> (Arc<Gateway>, std::net::SocketAddr, CancellationToken) {
    let gateway = Arc::new(Gateway::builder().build(Arc::new(llm)));
    let mut agent = AgentRecord::test("main");
    agent.key = "main".into();
    gateway.agents.put(&agent).await.unwrap();

    let shutdown = CancellationToken::new();
    let (addr, _handle) = serve::serve_ephemeral(Arc::clone(&gateway), shutdown.clone())
        .await
        .unwrap();
    (gateway, addr, shutdown)
}

async fn connect(
    addr: std::net::SocketAddr,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let (socket, _) = tokio_tungstenite::connect_async(format!("ws://{}/", addr))
        .await
        .expect("connect");
    socket
}

async fn next_json(
    socket: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> serde_json::Value {
    loop {
        let message = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
            .await
            .expect("timeout")
            .expect("closed")
            .expect("ws error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json");
        }
    }
}

#[tokio::test]
async fn ping_pong() {
    let (_gateway, addr, _shutdown) = start_gateway(ScriptedLlm::text("unused")).await;
    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(r#"{"type":"ping","id":"1"}"#.into()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "pong");
    assert_eq!(response["id"], "1");
}

#[tokio::test]
async fn run_round_trip() {
    let (_gateway, addr, _shutdown) = start_gateway(ScriptedLlm::text("hi from the agent")).await;
    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(
            r#"{"type":"run","id":"r1","agent":"main","content":"hello","user_id":"u1","chat_id":"c1"}"#
                .into(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "run_result");
    assert_eq!(response["content"], "hi from the agent");
    assert_eq!(response["iterations"], 1);
}

#[tokio::test]
async fn streaming_run_sends_chunks_before_result() {
    let (_gateway, addr, _shutdown) = start_gateway(ScriptedLlm::text("streamed reply")).await;
    let mut socket = connect(addr).await;
    socket
        .send(Message::Text(
            r#"{"type":"run","id":"r2","agent":"main","content":"hello","user_id":"u1","chat_id":"c2","stream":true}"#
                .into(),
        ))
        .await
        .unwrap();

    let first = next_json(&mut socket).await;
    assert_eq!(first["type"], "chunk");
    assert_eq!(first["content"], "streamed reply");
    let second = next_json(&mut socket).await;
    assert_eq!(second["type"], "run_result");
    assert_eq!(second["content"], "streamed reply");
}

#[tokio::test]
async fn lane_stats_and_invalid_json() {
    let (_gateway, addr, _shutdown) = start_gateway(ScriptedLlm::text("unused")).await;
    let mut socket = connect(addr).await;

    socket
        .send(Message::Text(r#"{"type":"lane_stats","id":"s1"}"#.into()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "lane_stats");
    let lanes = response["lanes"].as_array().unwrap();
    assert!(lanes.iter().any(|l| l["name"] == "main"));

    socket
        .send(Message::Text("not json".into()))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "error");
}

#[tokio::test]
async fn session_reset_acks_and_clears() {
    let (gateway, addr, _shutdown) = start_gateway(ScriptedLlm::text("reply")).await;
    let mut socket = connect(addr).await;

    socket
        .send(Message::Text(
            r#"{"type":"run","id":"r1","agent":"main","content":"hello","user_id":"u1","chat_id":"c9"}"#
                .into(),
        ))
        .await
        .unwrap();
    let _ = next_json(&mut socket).await;

    let keys = gateway.sessions.list_keys().await.unwrap();
    assert_eq!(keys.len(), 1);

    socket
        .send(Message::Text(
            r#"{"type":"session_reset","id":"x","agent":"main","chat_id":"c9"}"#.into(),
        ))
        .await
        .unwrap();
    let response = next_json(&mut socket).await;
    assert_eq!(response["type"], "ack");
    assert!(gateway.sessions.list_keys().await.unwrap().is_empty());
}
