//! WebSocket streaming of application events.
//!
//! Every event published on the state bus is forwarded as JSON. Clients may
//! also send commands: `preview` drives a per-connection debounced rule
//! preview, `ack` acknowledges a safety event.

use crate::preview::{parse_preview, PreviewService};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;
use skywatch_core::MatchSet;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Handler for WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> axum::response::Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
        .into_response()
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Preview {
        #[serde(default)]
        conditions: serde_json::Value,
    },
    Ack {
        event_id: String,
    },
}

type PreviewResults = watch::Receiver<Option<Arc<MatchSet>>>;

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let mut rx = state.tx.subscribe();
    let mut preview: Option<PreviewService> = None;
    let mut results: Option<PreviewResults> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = handle_command(&state, &text, &mut preview, &mut results);
                        if let Some(reply) = reply {
                            if socket.send(Message::Text(reply)).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                }
            }
            event = rx.recv() => {
                match event {
                    Ok(event) => {
                        let Some(text) = event.to_json() else {
                            continue;
                        };
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!("Stream client lagged, skipped {} event(s)", skipped);
                        continue;
                    }
                    Err(_) => break,
                }
            }
            update = next_preview(results.as_mut()) => {
                let Some(set) = update else {
                    results = None;
                    continue;
                };
                let text = json!({ "type": "preview", "result": set }).to_string();
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Wait for the next preview result. Never resolves while no preview is
/// running; `None` means the preview task is gone.
async fn next_preview(results: Option<&mut PreviewResults>) -> Option<Option<Arc<MatchSet>>> {
    let Some(results) = results else {
        return std::future::pending().await;
    };
    results.changed().await.ok()?;
    let current = results.borrow_and_update().clone();
    Some(current)
}

/// Apply one client command. Returns an immediate reply, if any.
fn handle_command(
    state: &Arc<AppState>,
    text: &str,
    preview: &mut Option<PreviewService>,
    results: &mut Option<PreviewResults>,
) -> Option<String> {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(err) => {
            return Some(json!({ "type": "error", "message": err.to_string() }).to_string());
        }
    };

    match command {
        ClientCommand::Preview { conditions } => match parse_preview(&conditions) {
            Ok(conditions) => {
                let service = preview.get_or_insert_with(|| PreviewService::spawn(state.clone()));
                if results.is_none() {
                    *results = Some(service.subscribe());
                }
                service.submit(conditions);
                None
            }
            Err(err) => Some(json!({ "type": "error", "message": err.to_string() }).to_string()),
        },
        ClientCommand::Ack { event_id } => match state.escalation().acknowledge(&event_id) {
            Ok(_) => None,
            Err(err) => Some(json!({ "type": "error", "message": err.to_string() }).to_string()),
        },
    }
}
