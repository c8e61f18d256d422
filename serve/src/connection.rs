//! WebSocket connection lifecycle: recv loop and request dispatch.
//!
//! Runs requested over the socket go through the same admission path as
//! channel traffic (session queues + `main` lane); streaming runs forward
//! content fragments as `chunk` frames before the final `run_result`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use tokio::sync::mpsc;
use trellis::sched::{Admission, LANE_MAIN};
use trellis::{Gateway, PeerKind, PromptMode, RunRequest, SessionKey};

use super::protocol::{ClientRequest, RunParams, ServerResponse};

pub(crate) async fn handle_socket(mut socket: WebSocket, gateway: Arc<Gateway>) {
    while let Some(result) = socket.recv().await {
        let message = match result {
            Ok(m) => m,
            Err(e) => {
                tracing::warn!("read error (client closed?): {}", e);
                break;
            }
        };
        let text = match &message {
            Message::Text(t) => t.clone(),
            Message::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Message::Close(_) => break,
            _ => continue,
        };

        if let Err(e) = handle_request(&text, &mut socket, &gateway).await {
            tracing::warn!("handle_request error: {}", e);
            break;
        }
    }
}

async fn send(
    socket: &mut WebSocket,
    response: &ServerResponse,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let text = serde_json::to_string(response)?;
    socket.send(Message::Text(text)).await?;
    Ok(())
}

async fn handle_request(
    text: &str,
    socket: &mut WebSocket,
    gateway: &Arc<Gateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let request: ClientRequest = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            return send(
                socket,
                &ServerResponse::Error {
                    id: None,
                    error: format!("parse error: {}", e),
                },
            )
            .await;
        }
    };

    match request {
        ClientRequest::Ping { id } => send(socket, &ServerResponse::Pong { id }).await,
        ClientRequest::LaneStats { id } => {
            send(
                socket,
                &ServerResponse::LaneStats {
                    id,
                    lanes: gateway.lanes.stats(),
                },
            )
            .await
        }
        ClientRequest::SessionReset { id, agent, chat_id } => {
            match resolve_session_key(gateway, &agent, &chat_id).await {
                Ok(key) => {
                    let key = key.to_string();
                    gateway.queues.cancel(&key);
                    match gateway.sessions.delete(&key).await {
                        Ok(()) => send(socket, &ServerResponse::Ack { id }).await,
                        Err(e) => {
                            send(
                                socket,
                                &ServerResponse::Error {
                                    id,
                                    error: e.to_string(),
                                },
                            )
                            .await
                        }
                    }
                }
                Err(error) => send(socket, &ServerResponse::Error { id, error }).await,
            }
        }
        ClientRequest::Run(params) => handle_run(params, socket, gateway).await,
    }
}

async fn resolve_session_key(
    gateway: &Arc<Gateway>,
    agent_key: &str,
    chat_id: &str,
) -> Result<SessionKey, String> {
    let wanted = if agent_key.is_empty() {
        gateway.config.default_agent_key.clone()
    } else {
        agent_key.to_string()
    };
    let agent = gateway
        .agents
        .get_by_key(&wanted)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("unknown agent: {}", wanted))?;
    SessionKey::new(&agent.id, "websocket", PeerKind::Direct, chat_id).map_err(|e| e.to_string())
}

async fn handle_run(
    params: RunParams,
    socket: &mut WebSocket,
    gateway: &Arc<Gateway>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let id = params.id.clone();
    let session_key = match resolve_session_key(gateway, &params.agent, &params.chat_id).await {
        Ok(k) => k,
        Err(error) => return send(socket, &ServerResponse::Error { id, error }).await,
    };
    let key = session_key.to_string();

    let inbound = trellis::InboundMessage {
        channel: "websocket".into(),
        sender_id: params.user_id.clone(),
        chat_id: params.chat_id.clone(),
        peer_kind: PeerKind::Direct,
        content: params.content.clone(),
        user_id: params.user_id.clone(),
        agent_key: params.agent.clone(),
        metadata: Default::default(),
    };

    // WebSocket runs use the same per-session admission as channel traffic.
    let guard = match gateway.queues.admit(&key, inbound, 1).await {
        Admission::Start { guard, .. } => guard,
        Admission::Queued | Admission::Merged => {
            return send(
                socket,
                &ServerResponse::Error {
                    id,
                    error: "session is busy; message queued".into(),
                },
            )
            .await;
        }
        Admission::Rejected { reason } => {
            return send(socket, &ServerResponse::Error { id, error: reason }).await;
        }
    };

    let mut req = RunRequest::new(session_key, params.content, &params.user_id);
    req.run_id = guard.run_id().to_string();
    req.channel = "websocket".into();
    req.chat_id = params.chat_id.clone();
    req.prompt_mode = PromptMode::Full;
    req.cancel = guard.cancel_token();
    req.followups = Some(guard.followup_handle());

    // Stream fragments are forwarded while the run executes.
    let (chunk_tx, mut chunk_rx) = mpsc::channel(64);
    if params.stream {
        req.stream = Some(chunk_tx);
    } else {
        drop(chunk_tx);
    }

    let cancel = guard.cancel_token();
    let run_fn = Arc::clone(&gateway.run_fn);
    let lanes = Arc::clone(&gateway.lanes);
    let mut run = tokio::spawn(async move {
        lanes.submit(LANE_MAIN, &cancel, (run_fn)(req)).await
    });

    let outcome = loop {
        tokio::select! {
            chunk = chunk_rx.recv() => {
                if let Some(chunk) = chunk {
                    send(socket, &ServerResponse::Chunk { id: id.clone(), content: chunk.content }).await?;
                }
            }
            joined = &mut run => break joined,
        }
    };
    // Drain fragments that raced the completion.
    while let Ok(chunk) = chunk_rx.try_recv() {
        send(
            socket,
            &ServerResponse::Chunk {
                id: id.clone(),
                content: chunk.content,
            },
        )
        .await?;
    }

    // Messages queued behind this run (their requesters were already told
    // the session was busy) still execute so the session log stays honest;
    // their output has no socket to go to.
    let mut leftover = gateway.queues.finish(guard).await;
    while let Some((queued, next_guard)) = leftover {
        if let Ok(queued_key) = SessionKey::parse(&key) {
            let mut queued_req =
                RunRequest::new(queued_key, queued.content, &queued.user_id);
            queued_req.run_id = next_guard.run_id().to_string();
            queued_req.channel = "websocket".into();
            queued_req.chat_id = queued.chat_id.clone();
            queued_req.cancel = next_guard.cancel_token();
            queued_req.followups = Some(next_guard.followup_handle());
            let queued_cancel = next_guard.cancel_token();
            let run_fn = Arc::clone(&gateway.run_fn);
            let _ = gateway
                .lanes
                .submit(LANE_MAIN, &queued_cancel, (run_fn)(queued_req))
                .await;
        }
        leftover = gateway.queues.finish(next_guard).await;
    }

    let response = match outcome {
        Ok(Ok(Ok(result))) => ServerResponse::RunResult {
            id,
            content: result.content,
            iterations: result.iterations,
        },
        Ok(Ok(Err(e))) => ServerResponse::Error {
            id,
            error: e.to_string(),
        },
        Ok(Err(lane_err)) => ServerResponse::Error {
            id,
            error: lane_err.to_string(),
        },
        Err(join_err) => ServerResponse::Error {
            id,
            error: format!("run task failed: {}", join_err),
        },
    };
    send(socket, &response).await
}
