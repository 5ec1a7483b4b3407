// Copyright 2024 AION Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Relayer handlers for HTTP/Socket calls

#![warn(missing_docs)]

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::prelude::*;
use serde::Deserialize;

use aion_chain_gateway::EscrowGateway;
use aion_event_bus::{BusEvent, EventBus, SubscriberId};
use aion_relayer_context::RelayerContext;
use aion_relayer_utils::probe;

use rate_limit::SlidingWindow;

/// Per-client rate limiting for the submission endpoint.
pub mod rate_limit;
/// Module handles relayer API
pub mod routes;

/// Interval of transport-level pings on subscription connections. A
/// client that missed the previous ping's pong is disconnected.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// How many bus events a subscriber may lag behind before it is evicted.
const SUBSCRIBER_BUFFER: usize = 64;

/// Shared state of all HTTP and WebSocket handlers.
pub struct AppState {
    /// The relayer context (config, store, bus, concurrency state).
    pub ctx: RelayerContext,
    /// The escrow chain gateway.
    pub gateway: Arc<EscrowGateway>,
    /// Sliding-window limiter of the submission endpoint.
    pub rate_limiter: SlidingWindow,
}

impl AppState {
    /// Builds the handler state from the context and gateway.
    pub fn new(ctx: RelayerContext, gateway: Arc<EscrowGateway>) -> Self {
        let rate_limiter = SlidingWindow::new(&ctx.config.rate_limit);
        Self {
            ctx,
            gateway,
            rate_limiter,
        }
    }
}

/// Inbound messages of the subscription protocol.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientMessage {
    /// Opt into a topic, e.g. `transfer:42`.
    Subscribe {
        /// The topic to join.
        topic: String,
    },
    /// Drop a topic subscription.
    Unsubscribe {
        /// The topic to leave.
        topic: String,
    },
    /// Application-level ping; answered with a `pong` message.
    Ping,
}

/// Wait for websocket connection upgrade
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| accept_websocket_connection(socket, state))
}

/// Runs one subscription connection: registers the client on the event
/// bus, multiplexes its topic subscriptions, and enforces the heartbeat.
///
/// # Arguments
///
/// * `ws` - Websocket stream
/// * `state` - Handler state that holds the context and event bus
async fn accept_websocket_connection(ws: WebSocket, state: Arc<AppState>) {
    let bus = state.ctx.bus().clone();
    let (subscriber_id, mut events) = bus.register(SUBSCRIBER_BUFFER);
    let client_id = format!("client-{subscriber_id}");
    let (mut sink, mut stream) = ws.split();

    let connected = BusEvent::new(
        "connected",
        serde_json::json!({ "clientId": client_id }),
    );
    if send_event(&mut sink, &connected).await.is_err() {
        bus.unregister(subscriber_id);
        return;
    }
    tracing::event!(
        target: probe::TARGET,
        tracing::Level::DEBUG,
        kind = %probe::Kind::EventBus,
        client_id = %client_id,
        connected = true,
    );

    let mut shutdown = state.ctx.shutdown_signal();
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    // the first tick fires immediately; skip it so the first real ping
    // happens one full interval after connecting
    heartbeat.tick().await;
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            maybe_event = events.recv() => {
                let Some(event) = maybe_event else {
                    // evicted by the bus as a slow consumer
                    break;
                };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if awaiting_pong {
                    tracing::debug!(
                        client_id = %client_id,
                        "Client missed a heartbeat, disconnecting"
                    );
                    break;
                }
                if sink.send(Message::Ping(vec![])).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        if handle_client_message(
                            &bus,
                            subscriber_id,
                            &text,
                            &mut sink,
                        )
                        .await
                        .is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("Websocket error: {e}");
                        break;
                    }
                }
            }
        }
    }

    bus.unregister(subscriber_id);
    tracing::debug!(client_id = %client_id, "Subscription connection closed");
}

async fn send_event<TX>(
    sink: &mut TX,
    event: &BusEvent,
) -> aion_relayer_utils::Result<()>
where
    TX: Sink<Message> + Unpin,
{
    let text = serde_json::to_string(event)?;
    sink.send(Message::Text(text))
        .map_err(|_| aion_relayer_utils::Error::FailedToSendResponse)
        .await
}

/// Applies one inbound protocol message and acknowledges it.
///
/// Malformed payloads are answered with an `error` message instead of
/// closing the connection.
async fn handle_client_message<TX>(
    bus: &EventBus,
    subscriber_id: SubscriberId,
    text: &str,
    sink: &mut TX,
) -> aion_relayer_utils::Result<()>
where
    TX: Sink<Message> + Unpin,
{
    let reply = match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe { topic }) => {
            bus.subscribe(subscriber_id, &topic);
            BusEvent::new("subscribed", serde_json::json!({ "topic": topic }))
        }
        Ok(ClientMessage::Unsubscribe { topic }) => {
            bus.unsubscribe(subscriber_id, &topic);
            BusEvent::new(
                "unsubscribed",
                serde_json::json!({ "topic": topic }),
            )
        }
        Ok(ClientMessage::Ping) => {
            BusEvent::new("pong", serde_json::json!({}))
        }
        Err(e) => {
            tracing::debug!("Got invalid payload: {e}");
            BusEvent::new(
                "error",
                serde_json::json!({ "error": "Invalid message format" }),
            )
        }
    };
    send_event(sink, &reply).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_messages_deserialize_by_type_tag() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"subscribe","topic":"transfer:7"}"#)
                .unwrap();
        assert!(matches!(
            msg,
            ClientMessage::Subscribe { ref topic } if topic == "transfer:7"
        ));

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        assert!(serde_json::from_str::<ClientMessage>(
            r#"{"type":"shout","topic":"x"}"#
        )
        .is_err());
    }
}
