//! WebSocket fan-out: one JSON snapshot per text frame.

use crate::state::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| client_loop(socket, state))
}

async fn client_loop(socket: WebSocket, state: AppState) {
    let subscription = state.hub.subscribe();
    tracing::debug!(subscriber = %subscription.id(), "websocket client connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            maybe = subscription.recv() => match maybe {
                Some(snapshot) => {
                    let frame = match serde_json::to_string(&*snapshot) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!(error = %e, "snapshot serialization failed");
                            break;
                        }
                    };
                    if sink.send(Message::Text(frame)).await.is_err() {
                        break;
                    }
                }
                None => {
                    // Evicted or shut down; tell the client why.
                    let reason = subscription
                        .close_reason()
                        .unwrap_or_else(|| "server closing".into());
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1008,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            },
            inbound = stream.next() => match inbound {
                // The protocol expects nothing from clients beyond pings,
                // which axum answers automatically.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::debug!(subscriber = %subscription.id(), "websocket client disconnected");
    // Dropping the subscription unregisters it from the hub.
}
