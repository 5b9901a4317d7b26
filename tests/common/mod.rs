// Shared helpers for integration tests: a minimal chat echo service

#![allow(dead_code)]

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::Path;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::net::SocketAddr;

pub const ROOM_MIN: u32 = 1;
pub const ROOM_MAX: u32 = 20;

/// Starts the echo service on an ephemeral port and returns its address.
///
/// `/chat/{room}` acks every text frame with `{status, serverTimestamp, data, errors}`,
/// echoing the parsed message in `data`. Rooms outside 1..=20 are closed with 1008.
pub async fn spawn_echo_server() -> SocketAddr {
    let app = Router::new().route("/chat/{room}", get(chat));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

pub fn base_url(addr: SocketAddr) -> String {
    format!("ws://{addr}")
}

async fn chat(ws: WebSocketUpgrade, Path(room): Path<u32>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, room))
}

async fn handle_socket(mut socket: WebSocket, room: u32) {
    if !(ROOM_MIN..=ROOM_MAX).contains(&room) {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 1008,
                reason: "Invalid roomId".into(),
            })))
            .await;
        return;
    }

    while let Some(Ok(msg)) = socket.recv().await {
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        let reply = match serde_json::from_str::<serde_json::Value>(text.as_str()) {
            Ok(data) => json!({
                "status": "OK",
                "serverTimestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "data": data,
                "errors": [],
            }),
            Err(_) => json!({
                "status": "ERROR",
                "serverTimestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                "data": null,
                "errors": ["Invalid JSON"],
            }),
        };

        if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
            break;
        }
    }
}
