//! WebSocket transport for the UI boundary.
//!
//! ## Connection lifecycle
//!
//! 1. Client connects to `GET /api/ws?token=<api_key>`. The token is validated
//!    before the upgrade completes.
//! 2. All messages are JSON objects with a `"type"` field. An optional
//!    `"request_id"` on any incoming message is echoed on the reply.
//! 3. Every connection subscribes to the UI event channel and receives all
//!    session output, exits and permission prompts. While at least one
//!    connection is open the permission broker can reach an operator.
//! 4. On disconnect, sessions this connection attached are detached. They
//!    keep running and buffering for the next attach.
//!
//! ## Message types (client → server)
//!
//! | Type                    | Fields                                   | Reply                         |
//! |-------------------------|------------------------------------------|-------------------------------|
//! | `ping`                  | -                                        | `pong`                        |
//! | `session.create_or_get` | `pane_id`, `cwd?`                        | `session.ready` or `error`    |
//! | `session.attach`        | `session_id`                             | `session.attached` or `error` |
//! | `session.detach`        | `session_id`                             | `session.detached`            |
//! | `session.write`         | `session_id`, `data`                     | (none)                        |
//! | `session.resize`        | `session_id`, `cols`, `rows`             | (none)                        |
//! | `session.kill`          | `session_id`                             | `session.killed`              |
//! | `session.for_pane`      | `pane_id`                                | `session.pane`                |
//! | `session.list`          | -                                        | `session.listed`              |
//! | `shell.list`            | -                                        | `shell.listed`                |
//! | `permission.respond`    | `permission_id`, `decision`, `message?`, `permission_updates?`, `updated_input?`, `interrupt?` | `permission.responded` |
//!
//! ## Broadcasts (server → client)
//!
//! `session.output`, `session.exit`, `session.destroyed`,
//! `permission.requested`, `permission.resolved`. See [`crate::events::UiEvent`].
//!
//! Errors are `{"type": "error", "code", "message"}` with `code` one of
//! `INVALID_JSON`, `MISSING_FIELD`, `NOT_FOUND`, `SPAWN_FAILED`,
//! `SESSION_LIMIT`, `UNKNOWN_TYPE`.

use std::collections::HashSet;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::permissions::PermissionResponse;
use crate::AppState;

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (since HTTP headers aren't available
    /// during a browser WebSocket upgrade).
    pub token: String,
}

/// `GET /api/ws?token=<key>`: WebSocket upgrade handler.
///
/// Validates the token before upgrading. Returns `403 Forbidden` on auth
/// failure.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if !crate::auth::constant_time_eq(state.config.auth.api_key.as_bytes(), query.token.as_bytes())
    {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    ws.on_upgrade(move |socket| handle_ws(socket, state))
}

/// Reply channel of one connection, with the request ID to echo.
struct Reply<'a> {
    tx: &'a mpsc::Sender<Value>,
    request_id: Option<&'a str>,
}

impl Reply<'_> {
    async fn send(&self, mut msg: Value) {
        if let Some(rid) = self.request_id {
            msg["request_id"] = json!(rid);
        }
        let _ = self.tx.send(msg).await;
    }

    async fn error(&self, code: &str, message: impl Into<String>) {
        self.send(json!({
            "type": "error",
            "code": code,
            "message": message.into(),
        }))
        .await;
    }

    async fn missing(&self, fields: &str) {
        self.error("MISSING_FIELD", format!("{fields} required")).await;
    }
}

/// Main WebSocket event loop.
///
/// Splits the socket into a sink (outgoing) and stream (incoming). Outgoing
/// messages are funneled through an mpsc channel so replies and broadcast
/// events share one writer.
async fn handle_ws(socket: WebSocket, state: AppState) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Value>(256);
    let mut events_rx = state.events.subscribe();

    info!("UI connected ({} total)", state.events.receiver_count());

    // Sessions attached over this connection, detached on disconnect.
    let mut attached: HashSet<String> = HashSet::new();

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let text = match serde_json::to_string(&msg) {
                Ok(t) => t,
                Err(e) => {
                    error!("WS send: failed to serialize message: {e}");
                    continue;
                }
            };
            if ws_sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            ws_msg = ws_stream.next() => {
                let Some(Ok(msg)) = ws_msg else { break };
                match msg {
                    Message::Text(text) => {
                        handle_message(&state, &tx, &text, &mut attached).await;
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            event = events_rx.recv() => {
                match event {
                    Ok(event) => match serde_json::to_value(&event) {
                        Ok(v) => {
                            if tx.send(v).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => error!("WS broadcast: failed to serialize event: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("UI connection lagged, skipped {n} event(s)");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // Stop counting as a UI before anything else so the broker sees it.
    drop(events_rx);
    for session_id in &attached {
        state.registry.detach(session_id).await;
    }
    info!("UI disconnected, detached {} session(s)", attached.len());
    send_task.abort();
}

async fn handle_message(
    state: &AppState,
    tx: &mpsc::Sender<Value>,
    text: &str,
    attached: &mut HashSet<String>,
) {
    let Ok(parsed) = serde_json::from_str::<Value>(text) else {
        let _ = tx
            .send(json!({
                "type": "error",
                "code": "INVALID_JSON",
                "message": "Failed to parse JSON message"
            }))
            .await;
        return;
    };

    let msg_type = parsed["type"].as_str().unwrap_or("");
    let reply = Reply {
        tx,
        request_id: parsed["request_id"].as_str(),
    };
    let session_id = parsed["session_id"].as_str().unwrap_or("");

    match msg_type {
        "ping" => reply.send(json!({"type": "pong"})).await,
        "session.create_or_get" => {
            let pane_id = parsed["pane_id"].as_str().unwrap_or("");
            if pane_id.is_empty() {
                reply.missing("pane_id").await;
                return;
            }
            let cwd = parsed["cwd"]
                .as_str()
                .filter(|c| !c.is_empty())
                .unwrap_or(state.config.sessions.default_cwd.as_str());
            match state.registry.create_or_get(pane_id, cwd).await {
                Ok(handle) => {
                    reply
                        .send(json!({
                            "type": "session.ready",
                            "pane_id": pane_id,
                            "session_id": handle.session_id,
                            "pid": handle.pid,
                            "is_existing": handle.is_existing,
                        }))
                        .await;
                }
                Err(e) => {
                    error!("create_or_get for pane {pane_id} failed: {e}");
                    reply.error(e.code(), e.to_string()).await;
                }
            }
        }
        "session.attach" => {
            if session_id.is_empty() {
                reply.missing("session_id").await;
                return;
            }
            match state.registry.attach(session_id).await {
                Some(snapshot) => {
                    attached.insert(session_id.to_string());
                    reply
                        .send(json!({
                            "type": "session.attached",
                            "session_id": session_id,
                            "pid": snapshot.pid,
                            "entries": snapshot.buffered_output,
                        }))
                        .await;
                }
                None => {
                    reply
                        .error("NOT_FOUND", format!("Session {session_id} not found"))
                        .await;
                }
            }
        }
        "session.detach" => {
            if session_id.is_empty() {
                reply.missing("session_id").await;
                return;
            }
            attached.remove(session_id);
            let existed = state.registry.detach(session_id).await;
            reply
                .send(json!({
                    "type": "session.detached",
                    "session_id": session_id,
                    "existed": existed,
                }))
                .await;
        }
        "session.write" => {
            let data = parsed["data"].as_str().unwrap_or("");
            if session_id.is_empty() {
                reply.missing("session_id").await;
                return;
            }
            if !state.registry.write(session_id, data.as_bytes()).await {
                debug!("write to unknown session {session_id} dropped");
            }
        }
        "session.resize" => {
            let cols = parsed["cols"].as_u64().and_then(|v| u16::try_from(v).ok());
            let rows = parsed["rows"].as_u64().and_then(|v| u16::try_from(v).ok());
            match (session_id.is_empty(), cols, rows) {
                (false, Some(cols), Some(rows)) => {
                    state.registry.resize(session_id, cols, rows).await;
                }
                _ => reply.missing("session_id, cols and rows").await,
            }
        }
        "session.kill" => {
            if session_id.is_empty() {
                reply.missing("session_id").await;
                return;
            }
            attached.remove(session_id);
            let existed = state.registry.kill(session_id).await;
            reply
                .send(json!({
                    "type": "session.killed",
                    "session_id": session_id,
                    "existed": existed,
                }))
                .await;
        }
        "session.for_pane" => {
            let pane_id = parsed["pane_id"].as_str().unwrap_or("");
            if pane_id.is_empty() {
                reply.missing("pane_id").await;
                return;
            }
            let found = state.registry.get_session_for_pane(pane_id).await;
            reply
                .send(json!({
                    "type": "session.pane",
                    "pane_id": pane_id,
                    "session_id": found,
                }))
                .await;
        }
        "session.list" => {
            let sessions = state.registry.list_sessions().await;
            reply
                .send(json!({
                    "type": "session.listed",
                    "sessions": sessions,
                }))
                .await;
        }
        "shell.list" => {
            reply
                .send(json!({
                    "type": "shell.listed",
                    "shells": crate::shell::detect_shells(),
                    "default_shell": state.registry.options().shell,
                }))
                .await;
        }
        "permission.respond" => {
            let permission_id = parsed["permission_id"].as_str().unwrap_or("");
            if permission_id.is_empty() {
                reply.missing("permission_id and decision").await;
                return;
            }
            let response = match serde_json::from_value::<PermissionResponse>(parsed.clone()) {
                Ok(r) => r,
                Err(e) => {
                    reply
                        .error("MISSING_FIELD", format!("Invalid permission response: {e}"))
                        .await;
                    return;
                }
            };
            let resolved = state.broker.resolve(permission_id, response).await;
            reply
                .send(json!({
                    "type": "permission.responded",
                    "permission_id": permission_id,
                    "resolved": resolved,
                }))
                .await;
        }
        _ => {
            reply
                .error("UNKNOWN_TYPE", format!("Unknown message type: {msg_type}"))
                .await;
        }
    }
}
