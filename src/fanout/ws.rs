//! WebSocket fanout protocol handler: `WebSocketUpgrade` + `State<Arc<...>>`, a tagged-enum
//! JSON command protocol (`open`/`resize`) driven over `futures::{SinkExt,StreamExt}`.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use super::decoder::{CameraDecoder, ViewerHandle};
use super::FanoutState;

#[derive(Deserialize)]
#[serde(tag = "act", rename_all = "snake_case")]
enum ClientMessage {
    Open { url: String, resolution: (u32, u32) },
    Resize { resolution: (u32, u32) },
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<FanoutState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<FanoutState>) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let id = state.next_viewer_id();
    let mut current: Option<Arc<CameraDecoder>> = None;

    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else { continue };
        let client_msg = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(m) => m,
            Err(err) => {
                debug!(%text, error = %err, "unrecognized fanout ws message");
                continue;
            }
        };
        match client_msg {
            ClientMessage::Open { url, resolution } => {
                if let Some(previous) = current.take() {
                    previous.detach(id).await;
                }
                let decoder = state.decoder_for(&url).await;
                decoder
                    .attach(ViewerHandle {
                        id,
                        resolution,
                        quality: 0,
                        sender: tx.clone(),
                    })
                    .await;
                current = Some(decoder);
            }
            ClientMessage::Resize { resolution } => {
                if let Some(decoder) = &current {
                    decoder.resize(id, resolution).await;
                }
            }
        }
    }

    if let Some(decoder) = current {
        decoder.detach(id).await;
    }
    send_task.abort();
}
