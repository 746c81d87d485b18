//! Per-client WebSocket connection handling.
//!
//! One logical channel per client: inbound JSON messages are parsed and
//! handed to the conversation handler; outbound [`ServerMessage`]s are
//! flushed from the client's channel. Disconnection releases the
//! client's gate waiters and cancels its active turn before teardown.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use super::AppState;
use crate::conversation::{ClientHandle, ClientId, GroupId};
use crate::protocol::ClientMessage;

/// Connection parameters: stable id, display name, optional group room.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub id: Option<String>,
    pub name: Option<String>,
    pub group: Option<String>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>, params: ConnectParams) {
    let client_id = ClientId(params.id.unwrap_or_else(|| Uuid::new_v4().to_string()));
    let name = params
        .name
        .unwrap_or_else(|| state.default_assistant_name.clone());

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    state.handler.clients.register(ClientHandle::new(
        client_id.clone(),
        name.clone(),
        outbound_tx,
    ));
    if let Some(room) = &params.group {
        state
            .handler
            .groups
            .join(&GroupId::from_room(room), &client_id);
    }
    info!(client = %client_id, name = %name, group = ?params.group, "websocket connected");

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => {
                let Some(msg) = outbound else { break };
                let json = match serde_json::to_string(&msg) {
                    Ok(json) => json,
                    Err(e) => {
                        debug!(client = %client_id, error = %e, "unserializable outbound message");
                        continue;
                    }
                };
                if socket.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                let Some(Ok(msg)) = inbound else { break };
                match msg {
                    Message::Text(text) => {
                        match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => {
                                state.handler.on_message(&client_id, message).await;
                            }
                            Err(e) => {
                                debug!(client = %client_id, error = %e, "unparseable message dropped");
                            }
                        }
                    }
                    Message::Binary(data) => {
                        debug!(client = %client_id, bytes = data.len(), "binary frame ignored");
                    }
                    Message::Ping(data) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Message::Pong(_) => {}
                    Message::Close(_) => {
                        info!(client = %client_id, "websocket closed by client");
                        break;
                    }
                }
            }
        }
    }

    state.handler.client_disconnected(&client_id).await;
    info!(client = %client_id, "websocket connection closed");
}
