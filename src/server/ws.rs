//! `/ws`: per-connection delivery socket.

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AppState;
use crate::delivery::{ClientRequest, ServerEvent, SessionInfo};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn send_frame(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode frame");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let client_id = Uuid::new_v4().to_string();
    let mut rx = state.router.register(&client_id).await;
    info!(client_id = %client_id, "WebSocket client connected");

    let session = ServerEvent::Session(SessionInfo {
        client_id: client_id.clone(),
    });
    let stats = ServerEvent::Stats(state.queue.stats().await);
    let greeted = send_frame(&mut socket, &session).await && send_frame(&mut socket, &stats).await;

    if greeted {
        loop {
            tokio::select! {
                // Addressed and broadcast frames for this client
                outgoing = rx.recv() => {
                    let Some(event) = outgoing else { break };
                    if !send_frame(&mut socket, &event).await {
                        debug!(client_id = %client_id, "Client disconnected during send");
                        break;
                    }
                }

                incoming = socket.recv() => {
                    match incoming {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str::<ClientRequest>(&text) {
                                Ok(ClientRequest::Stats) => {
                                    let stats = ServerEvent::Stats(state.queue.stats().await);
                                    if !send_frame(&mut socket, &stats).await {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    debug!(client_id = %client_id, error = %e, "Unrecognized WS frame");
                                }
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if socket.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(client_id = %client_id, error = %e, "WebSocket error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    state.router.unregister(&client_id).await;
    let cancelled = state.reaper.cancel_client_jobs(&client_id).await;
    info!(client_id = %client_id, cancelled, "WebSocket client disconnected");
}
