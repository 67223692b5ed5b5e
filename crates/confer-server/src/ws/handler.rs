use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use confer_protocol::{ClientMessage, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    let client_id = Uuid::new_v4();

    // Create channel for outbound messages
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    // Registers the connection and queues the `connected` greeting
    state.signaling.connect(client_id, tx).await;

    // Spawn task to forward messages from channel to WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg.into())).await.is_err() {
                break;
            }
        }
    });

    // Messages from one client are handled strictly in order
    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let client_msg = match ClientMessage::from_json(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!("Invalid message from {}: {}", client_id, e);
                        state
                            .connections
                            .send_to_connection(
                                client_id,
                                &ServerMessage::Error {
                                    message: e.to_string(),
                                },
                            )
                            .await;
                        continue;
                    }
                };

                state.signaling.handle_message(client_id, client_msg).await;
            }
            Ok(Message::Close(_)) => break,
            Err(e) => {
                tracing::error!("WebSocket error for client {}: {}", client_id, e);
                break;
            }
            // axum answers protocol-level pings itself
            _ => {}
        }
    }

    // Cleanup on disconnect
    state.signaling.disconnect(client_id).await;

    // Abort the send task
    send_task.abort();

    tracing::info!("Client {} disconnected from WebSocket", client_id);
}
