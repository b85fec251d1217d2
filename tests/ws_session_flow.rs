//! End-to-end UI flow over a real WebSocket.

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use paneld::permissions::PermissionRequest;
use paneld::{routes, AppState, Config};

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn start_server() -> (AppState, String) {
    let mut config = Config::default();
    config.auth.api_key = "e2e-key".into();
    config.sessions.shell = "/bin/sh".into();
    config.sessions.pty = false;
    let state = AppState::new(config);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = routes::router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (state, format!("ws://{addr}/api/ws"))
}

async fn send(ws: &mut Ws, msg: Value) {
    ws.send(Message::text(msg.to_string())).await.unwrap();
}

/// Read until a message matches `pred`, skipping everything else.
async fn next_where(ws: &mut Ws, pred: impl Fn(&Value) -> bool) -> Value {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let msg = ws.next().await.expect("socket closed").unwrap();
            let Ok(text) = msg.to_text() else { continue };
            let Ok(v) = serde_json::from_str::<Value>(text) else {
                continue;
            };
            if pred(&v) {
                return v;
            }
        }
    })
    .await
    .expect("timed out waiting for message")
}

async fn reply_to(ws: &mut Ws, request_id: &str) -> Value {
    let rid = request_id.to_string();
    next_where(ws, move |v| v["request_id"] == rid.as_str()).await
}

#[tokio::test]
async fn test_bad_token_is_rejected() {
    let (_state, url) = start_server().await;
    let result = tokio_tungstenite::connect_async(format!("{url}?token=nope")).await;
    assert!(result.is_err());
}

#[tokio::test]
async fn test_pane_session_lifecycle() {
    let (_state, url) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?token=e2e-key"))
        .await
        .unwrap();
    let dir = tempfile::tempdir().unwrap();
    let cwd = dir.path().to_str().unwrap();

    send(&mut ws, json!({"type": "ping", "request_id": "p"})).await;
    assert_eq!(reply_to(&mut ws, "p").await["type"], "pong");

    send(
        &mut ws,
        json!({"type": "session.create_or_get", "pane_id": "pane-1", "cwd": cwd, "request_id": "c1"}),
    )
    .await;
    let ready = reply_to(&mut ws, "c1").await;
    assert_eq!(ready["type"], "session.ready");
    assert_eq!(ready["is_existing"], false);
    let session_id = ready["session_id"].as_str().unwrap().to_string();

    send(
        &mut ws,
        json!({"type": "session.write", "session_id": session_id, "data": "echo hello-pane\n"}),
    )
    .await;
    let sid = session_id.clone();
    let output = next_where(&mut ws, move |v| {
        v["type"] == "session.output"
            && v["session_id"] == sid.as_str()
            && v["data"].as_str().is_some_and(|d| d.contains("hello-pane"))
    })
    .await;
    assert_eq!(output["stream"], "stdout");

    send(&mut ws, json!({"type": "session.detach", "session_id": session_id, "request_id": "d"})).await;
    assert_eq!(reply_to(&mut ws, "d").await["type"], "session.detached");

    send(&mut ws, json!({"type": "session.attach", "session_id": session_id, "request_id": "a"})).await;
    let attached = reply_to(&mut ws, "a").await;
    assert_eq!(attached["type"], "session.attached");
    let replayed: String = attached["entries"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|e| e["data"].as_str())
        .collect();
    assert!(replayed.contains("hello-pane"));

    send(
        &mut ws,
        json!({"type": "session.create_or_get", "pane_id": "pane-1", "cwd": cwd, "request_id": "c2"}),
    )
    .await;
    let again = reply_to(&mut ws, "c2").await;
    assert_eq!(again["session_id"], session_id.as_str());
    assert_eq!(again["is_existing"], true);

    send(&mut ws, json!({"type": "session.kill", "session_id": session_id, "request_id": "k"})).await;
    assert_eq!(reply_to(&mut ws, "k").await["existed"], true);

    send(&mut ws, json!({"type": "session.for_pane", "pane_id": "pane-1", "request_id": "f"})).await;
    let pane = reply_to(&mut ws, "f").await;
    assert_eq!(pane["type"], "session.pane");
    assert!(pane["session_id"].is_null());

    send(&mut ws, json!({"type": "session.attach", "session_id": session_id, "request_id": "a2"})).await;
    assert_eq!(reply_to(&mut ws, "a2").await["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_protocol_errors() {
    let (_state, url) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?token=e2e-key"))
        .await
        .unwrap();

    ws.send(Message::text("{not json".to_string())).await.unwrap();
    let err = next_where(&mut ws, |v| v["type"] == "error").await;
    assert_eq!(err["code"], "INVALID_JSON");

    send(&mut ws, json!({"type": "session.create_or_get", "request_id": "m"})).await;
    assert_eq!(reply_to(&mut ws, "m").await["code"], "MISSING_FIELD");

    send(&mut ws, json!({"type": "nope", "request_id": "u"})).await;
    assert_eq!(reply_to(&mut ws, "u").await["code"], "UNKNOWN_TYPE");
}

#[tokio::test]
async fn test_permission_answered_from_ui() {
    let (state, url) = start_server().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("{url}?token=e2e-key"))
        .await
        .unwrap();

    // Wait until the connection is subscribed to UI events.
    send(&mut ws, json!({"type": "ping", "request_id": "p"})).await;
    reply_to(&mut ws, "p").await;

    let broker = state.broker.clone();
    let wait = tokio::spawn(async move {
        let req = PermissionRequest {
            tool_name: "Bash".into(),
            input: json!({"command": "make deploy"}),
            tool_use_id: "toolu_e2e".into(),
            run_id: Some("run-1".into()),
            decision_reason: Some("not in allow list".into()),
            blocked_path: None,
            suggestions: Vec::new(),
        };
        broker.request(req, CancellationToken::new()).await
    });

    let prompt = next_where(&mut ws, |v| v["type"] == "permission.requested").await;
    assert_eq!(prompt["tool_name"], "Bash");
    assert_eq!(prompt["tool_use_id"], "toolu_e2e");
    let permission_id = prompt["permission_id"].as_str().unwrap().to_string();

    send(
        &mut ws,
        json!({
            "type": "permission.respond",
            "request_id": "r",
            "permission_id": permission_id,
            "decision": "deny",
            "message": "not today",
        }),
    )
    .await;
    assert_eq!(reply_to(&mut ws, "r").await["resolved"], true);

    let result = wait.await.unwrap();
    assert_eq!(result.tool_use_id, "toolu_e2e");
    assert_eq!(
        serde_json::to_value(&result.decision).unwrap(),
        json!({"behavior": "deny", "message": "not today", "interrupt": false})
    );

    // A second answer finds nothing pending.
    send(
        &mut ws,
        json!({
            "type": "permission.respond",
            "request_id": "r2",
            "permission_id": permission_id,
            "decision": "allow",
        }),
    )
    .await;
    assert_eq!(reply_to(&mut ws, "r2").await["resolved"], false);
}
