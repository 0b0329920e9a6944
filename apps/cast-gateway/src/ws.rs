use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use cast_signal::ClientId;
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use tracing::{debug, info, warn};

use crate::routes::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// One websocket is one signaling channel for the lifetime of the socket.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let mut link = state.hub.connect();
    let client_id = link.client_id().clone();
    gauge!("cast_gateway_signaling_sockets", state.hub.connected() as f64);
    info!(client_id = %client_id, "signaling socket connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_client = client_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = link.recv().await {
            let text = match message.encode() {
                Ok(text) => text,
                Err(err) => {
                    warn!(client_id = %writer_client, error = %err, "failed to encode outbound message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(client_id = %writer_client, "writer task finished");
    });

    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => forward(&state, &client_id, &text),
            Ok(Message::Binary(bytes)) => match std::str::from_utf8(&bytes) {
                Ok(text) => forward(&state, &client_id, text),
                Err(err) => {
                    counter!("cast_signal_messages_rejected_total", 1, "reason" => "malformed");
                    warn!(client_id = %client_id, error = %err, "dropping non-utf8 binary frame");
                }
            },
            Ok(Message::Close(frame)) => {
                info!(
                    client_id = %client_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "error receiving frame");
                break;
            }
        }
    }

    state.hub.disconnect(&client_id);
    writer.abort();
    gauge!("cast_gateway_signaling_sockets", state.hub.connected() as f64);
    info!(client_id = %client_id, "signaling socket closed");
}

fn forward(state: &AppState, client_id: &ClientId, text: &str) {
    if let Err(err) = state.hub.deliver_text(client_id, text) {
        warn!(client_id = %client_id, error = %err, "dropping signaling frame");
    }
}
