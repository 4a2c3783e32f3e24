use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use palaver_common::StreamChunk;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::api::ChatRequestBody;
use crate::state::SharedState;

/// Upper bound on an inbound WS frame; anything larger is a client bug.
const MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// GET /api/chat/stream — the bidirectional chat stream.
///
/// Protocol: the client sends one JSON `{messages, conversation_id?,
/// model?}` frame per turn; the server streams `StreamChunk` frames back
/// and terminates each turn with `{done:true, conversation_id}` or a
/// single `{error}` frame.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
) -> impl IntoResponse {
    ws.max_message_size(MAX_MESSAGE_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: SharedState) {
    info!("chat stream connected");

    while let Some(frame) = socket.recv().await {
        let frame = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let request: ChatRequestBody = match serde_json::from_str(&frame) {
            Ok(request) => request,
            Err(e) => {
                if send_chunk(&mut socket, &StreamChunk::error(format!("invalid request: {e}")))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        if request.is_empty() {
            if send_chunk(&mut socket, &StreamChunk::error("empty user content")).await.is_err() {
                break;
            }
            continue;
        }

        // Small buffer on purpose: a slow client applies backpressure all
        // the way up to the provider read.
        let (tx, mut rx) = mpsc::channel::<StreamChunk>(8);
        let orchestrator = Arc::clone(&state.orchestrator);
        let turn = request.into_turn();
        let run = tokio::spawn(async move { orchestrator.run(turn, tx).await });

        let mut client_gone = false;
        while let Some(chunk) = rx.recv().await {
            if send_chunk(&mut socket, &chunk).await.is_err() {
                // Dropping rx fails the orchestrator's next send, which
                // cancels the turn.
                client_gone = true;
                break;
            }
        }
        drop(rx);
        let _ = run.await;

        if client_gone {
            debug!("client went away mid-turn");
            break;
        }
    }

    info!("chat stream closed");
}

async fn send_chunk(socket: &mut WebSocket, chunk: &StreamChunk) -> Result<(), ()> {
    let payload = match serde_json::to_string(chunk) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("failed to serialize chunk: {e}");
            return Ok(());
        }
    };
    socket.send(Message::Text(payload.into())).await.map_err(|_| ())
}
