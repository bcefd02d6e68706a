//! WebSocket fan-out. A client's first message picks its channels; after
//! that, events flow out of the per-client bounded buffer and the only
//! expected inbound traffic is pings.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use serde::Deserialize;

use crate::events::Channel;
use crate::server::Gateway;

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channels: Vec<String>,
}

pub async fn upgrade(State(gateway): State<Arc<Gateway>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle(socket, gateway))
}

async fn handle(mut socket: WebSocket, gateway: Arc<Gateway>) {
    // The first message must be a subscribe; pings are tolerated while we
    // wait for it.
    let channels = loop {
        match socket.recv().await {
            Some(Ok(Message::Text(raw))) => {
                let Ok(message) = serde_json::from_str::<ClientMessage>(&raw) else {
                    continue;
                };
                match message.kind.as_str() {
                    "subscribe" => break parse_channels(&message.channels),
                    "ping" => {
                        if send_json(&mut socket, serde_json::json!({"type": "pong", "data": {}}))
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    _ => continue,
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                if socket.send(Message::Pong(payload)).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(_))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return,
        }
    };

    let subscribed: Vec<&str> = channels.iter().map(Channel::as_str).collect();
    if send_json(
        &mut socket,
        serde_json::json!({"type": "subscribed", "data": {"channels": subscribed}}),
    )
    .await
    .is_err()
    {
        return;
    }

    let mut subscription = gateway.events.subscribe(channels);
    loop {
        tokio::select! {
            event = subscription.rx.recv() => {
                let Some(payload) = event else {
                    // The bus dropped us as a slow consumer.
                    let _ = socket
                        .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                            code: 1008,
                            reason: "slow_consumer".into(),
                        })))
                        .await;
                    break;
                };
                let text = String::from_utf8_lossy(&payload).into_owned();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        if let Ok(message) = serde_json::from_str::<ClientMessage>(&raw) {
                            if message.kind == "ping"
                                && send_json(
                                    &mut socket,
                                    serde_json::json!({"type": "pong", "data": {}}),
                                )
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
    gateway.events.unsubscribe(subscription.id);
}

fn parse_channels(raw: &[String]) -> HashSet<Channel> {
    let parsed: HashSet<Channel> = raw
        .iter()
        .filter_map(|name| Channel::parse(name))
        .collect();
    if parsed.is_empty() {
        // No usable selection subscribes to everything, matching clients
        // that send an empty channel list.
        Channel::all().into_iter().collect()
    } else {
        parsed
    }
}

async fn send_json(
    socket: &mut WebSocket,
    value: serde_json::Value,
) -> Result<(), axum::Error> {
    socket.send(Message::Text(value.to_string())).await
}
