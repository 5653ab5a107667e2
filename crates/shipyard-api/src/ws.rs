//! WebSocket streaming of run events.
//!
//! Every connection receives all [`RunEvent`]s as JSON until it subscribes
//! to a single run with `{"type": "subscribe", "run_id": "..."}`.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use shipyard_core::ResourceId;
use shipyard_core::run::RunEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("WebSocket connection established");
    let (sender, receiver) = socket.split();
    stream_events(sender, receiver, state.scheduler.subscribe()).await;
}

/// Forward run events to the client and apply its subscribe commands until
/// either side goes away.
async fn stream_events<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut events: broadcast::Receiver<RunEvent>,
) where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: std::fmt::Display,
{
    let mut filter: Option<ResourceId> = None;

    loop {
        tokio::select! {
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    let reply = match serde_json::from_str::<WsCommand>(&text) {
                        Ok(WsCommand::Subscribe { run_id }) => {
                            info!(run_id = %run_id, "Client subscribed");
                            filter = Some(run_id);
                            WsMessage::Subscribed { run_id: Some(run_id) }
                        }
                        Ok(WsCommand::Unsubscribe) => {
                            info!("Client unsubscribed");
                            filter = None;
                            WsMessage::Subscribed { run_id: None }
                        }
                        Err(e) => WsMessage::Error { message: e.to_string() },
                    };
                    if send_json(&mut sender, &reply).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    info!("WebSocket connection closed");
                    break;
                }
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(event) => {
                    if filter.is_some_and(|id| id != event.run_id()) {
                        continue;
                    }
                    if send_json(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "WebSocket client fell behind");
                    if send_json(&mut sender, &WsMessage::Lagged { skipped }).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Closed) => break,
            },
        }
    }
}

async fn send_json<S, T>(sender: &mut S, value: &T) -> Result<(), ()>
where
    S: Sink<Message> + Unpin,
    T: Serialize,
{
    let json = serde_json::to_string(value).map_err(|_| ())?;
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsCommand {
    Subscribe { run_id: ResourceId },
    Unsubscribe,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WsMessage {
    Subscribed { run_id: Option<ResourceId> },
    Lagged { skipped: u64 },
    Error { message: String },
}
