//! WebSocket handler for live worker-log streaming.
//!
//! Query params: `history` (records replayed on connect) and `levels`
//! (comma separated initial filter). Inbound text frames are JSON
//! `ViewerCommand`s; outbound frames are JSON `ViewerEvent`s.

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use shared_types::{LevelFilter, ViewerCommand, ViewerEvent};
use tokio::time::{Duration, Instant};

use crate::api::ApiState;
use crate::viewer::SessionManager;

pub async fn logs_websocket(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<ApiState>,
) -> impl IntoResponse {
    let history = query.get("history").and_then(|v| v.parse::<usize>().ok());
    let filters = query
        .get("levels")
        .map(|v| LevelFilter::parse_csv(v))
        .unwrap_or_default();

    let sessions = state.app_state.sessions().clone();
    ws.on_upgrade(move |socket| handle_logs_socket(socket, sessions, history, filters))
}

async fn handle_logs_socket(
    socket: WebSocket,
    sessions: SessionManager,
    history: Option<usize>,
    filters: LevelFilter,
) {
    let (mut sender, mut receiver) = socket.split();
    let ping_interval = sessions.config().ping_interval;
    let ping_timeout = sessions.config().ping_timeout;

    let mut session = match sessions.connect(history, filters).await {
        Ok(session) => session,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to open viewer session");
            let _ = send_event(
                &mut sender,
                &ViewerEvent::Error {
                    message: e.to_string(),
                },
                ping_timeout,
            )
            .await;
            let _ = sender.close().await;
            return;
        }
    };

    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            maybe_msg = receiver.next() => {
                last_seen = Instant::now();
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ViewerCommand>(&text) {
                            Ok(command) => {
                                if let Err(e) = session.apply(command).await {
                                    tracing::warn!(session_id = %session.id(), error = %e, "Viewer command failed");
                                    let event = ViewerEvent::Error { message: e.to_string() };
                                    if send_event(&mut sender, &event, ping_timeout).await.is_err() {
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                let event = ViewerEvent::Error {
                                    message: format!("invalid command: {e}"),
                                };
                                if send_event(&mut sender, &event, ping_timeout).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session.id(), error = %e, "logs websocket receive error");
                        break;
                    }
                }
            }
            event = session.next_event() => {
                let Some(event) = event else {
                    break;
                };
                if send_event(&mut sender, &event, ping_timeout).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if last_seen.elapsed() > ping_timeout {
                    tracing::info!(session_id = %session.id(), "Viewer ping timeout");
                    break;
                }
                if sender.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    let _ = sender.close().await;
    drop(session);
}

/// Send one event as a JSON text frame; a peer that stops reading for
/// `timeout` counts as gone.
async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ViewerEvent,
    timeout: Duration,
) -> Result<(), ()> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            tracing::error!(error = %e, "Failed to serialize viewer event");
            return Ok(());
        }
    };
    match tokio::time::timeout(timeout, sender.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}
