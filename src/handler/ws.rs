//! Snapshot WebSocket.
//!
//! Server to client (text frames):
//!   `data:image/jpeg;base64,...`   one per encoded JPEG frame
//!   `{"type":"status", ...}`       once per second
//!   `{"type":"error","error":..}`  a rejected control message
//!
//! Client to server:
//!   `{"action":"switchSource","source":S}` or `{"type":"select_source","source":S}`

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use relay_bus::Pipeline;
use serde::Deserialize;
use tokio::time::{Instant, interval_at};

const STATUS_INTERVAL: Duration = Duration::from_secs(1);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub fn ws_router() -> Router<Arc<Pipeline>> {
    Router::new().route("/", get(ws_upgrade))
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(pipeline): State<Arc<Pipeline>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, pipeline))
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ClientMessage {
    SwitchSource(String),
}

#[derive(Deserialize)]
struct RawClientMessage {
    action: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    source: Option<String>,
}

pub(crate) fn parse_client_message(text: &str) -> Option<ClientMessage> {
    let raw: RawClientMessage = serde_json::from_str(text).ok()?;
    let is_switch = raw.action.as_deref() == Some("switchSource")
        || raw.kind.as_deref() == Some("select_source");
    if !is_switch {
        return None;
    }
    raw.source.map(ClientMessage::SwitchSource)
}

pub(crate) fn jpeg_data_url(jpeg: &[u8]) -> String {
    format!(
        "data:image/jpeg;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(jpeg)
    )
}

async fn status_message(pipeline: &Pipeline) -> Option<String> {
    let status = pipeline.status().await.ok()?;
    let mut value = serde_json::to_value(status).ok()?;
    value
        .as_object_mut()?
        .insert("type".into(), serde_json::Value::from("status"));
    Some(value.to_string())
}

async fn handle_ws(socket: WebSocket, pipeline: Arc<Pipeline>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut frames = pipeline.subscribe_jpeg();
    let mut status_tick = interval_at(Instant::now() + STATUS_INTERVAL, STATUS_INTERVAL);
    let mut ping_tick = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);
    let mut awaiting_pong = false;

    log::info!("WebSocket client connected");

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                if ws_tx.send(Message::Text(jpeg_data_url(&frame).into())).await.is_err() {
                    break;
                }
            }
            _ = status_tick.tick() => {
                let Some(text) = status_message(&pipeline).await else { continue };
                if ws_tx.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping_tick.tick() => {
                if awaiting_pong {
                    log::info!("WebSocket client missed a heartbeat, dropping");
                    break;
                }
                awaiting_pong = true;
                if ws_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Pong(_))) => awaiting_pong = false,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let Some(ClientMessage::SwitchSource(source)) = parse_client_message(text.as_str()) else {
                            log::debug!("ignoring WebSocket message: {}", text.as_str());
                            continue;
                        };
                        if let Err(e) = pipeline.switch_source(&source).await {
                            log::warn!("switch to {:?} rejected: {}", source, e);
                            let reply = serde_json::json!({
                                "type": "error",
                                "error": e.to_string(),
                                "kind": e.kind(),
                            });
                            if ws_tx.send(Message::Text(reply.to_string().into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    log::info!("WebSocket client disconnected");
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod ws_test;
