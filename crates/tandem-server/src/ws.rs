//! WebSocket feed - bus events out, nothing in
//!
//! Each connection registers one listener per core topic, pushes the
//! serialized events through an unbounded channel, and unregisters on
//! disconnect. The bus stays unordered fan-out; the channel serialises
//! per-connection delivery.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use tandem_core::bus::{topics, BusEvent, Handler};

use crate::AppState;

const RELAYED_TOPICS: &[&str] = &[
    topics::RESPOND,
    topics::STREAM,
    topics::CONTROL,
    topics::ERRORS,
    topics::COMPLETE,
    topics::CHANGE,
    topics::WAIT_TODO,
];

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| relay(socket, state))
}

async fn relay(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BusEvent>();

    let handler: Handler = Arc::new(move |event: BusEvent| {
        let _ = tx.send(event);
    });

    for topic in RELAYED_TOPICS {
        state.bus.listen(topic, Arc::clone(&handler));
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                let Ok(body) = serde_json::to_string(&event) else { continue };
                if sink.send(Message::Text(body)).await.is_err() {
                    break;
                }
            }
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // Inbound traffic other than close is ignored; input
                    // goes through the REST surface.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    for topic in RELAYED_TOPICS {
        state.bus.remove(topic, &handler);
    }
    tracing::debug!("websocket relay closed");
}
