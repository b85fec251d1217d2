//! Events pushed from the core to the UI boundary.
//!
//! Every connected WebSocket subscribes to one `broadcast` channel of
//! [`UiEvent`]s. The permission broker also uses the channel's receiver count
//! to decide whether any UI is reachable at all.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::sessions::buffer::OutputStream;

/// Capacity of the UI event channel. Slow subscribers lag and skip events.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Messages fanned out to every UI connection, serialized with a `type` tag.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum UiEvent {
    /// One chunk of process output, in production order.
    #[serde(rename = "session.output")]
    SessionOutput {
        session_id: String,
        seq: u64,
        stream: OutputStream,
        data: String,
    },
    /// The session's process exited. Sent once per session.
    #[serde(rename = "session.exit")]
    SessionExit {
        session_id: String,
        exit_code: Option<i32>,
    },
    /// The session was removed from the registry.
    #[serde(rename = "session.destroyed")]
    SessionDestroyed { session_id: String, reason: String },
    /// A tool call is waiting for an operator decision.
    #[serde(rename = "permission.requested")]
    PermissionRequested {
        permission_id: String,
        tool_name: String,
        input: Value,
        tool_use_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        run_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        decision_reason: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        blocked_path: Option<String>,
        #[serde(skip_serializing_if = "Vec::is_empty")]
        suggestions: Vec<Value>,
    },
    /// A pending permission was settled (by any path), so UIs can close prompts.
    #[serde(rename = "permission.resolved")]
    PermissionResolved {
        permission_id: String,
        tool_use_id: String,
        behavior: &'static str,
    },
}

pub type EventSender = broadcast::Sender<UiEvent>;

/// Create the shared UI event channel.
pub fn channel() -> EventSender {
    let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    tx
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_event_shape() {
        let ev = UiEvent::SessionOutput {
            session_id: "s1".into(),
            seq: 7,
            stream: OutputStream::Stdout,
            data: "hi".into(),
        };
        assert_eq!(
            serde_json::to_value(&ev).unwrap(),
            json!({
                "type": "session.output",
                "session_id": "s1",
                "seq": 7,
                "stream": "stdout",
                "data": "hi",
            })
        );
    }

    #[test]
    fn test_permission_requested_skips_empty_hints() {
        let ev = UiEvent::PermissionRequested {
            permission_id: "p1".into(),
            tool_name: "Bash".into(),
            input: json!({"command": "ls"}),
            tool_use_id: "tu1".into(),
            run_id: None,
            decision_reason: None,
            blocked_path: None,
            suggestions: Vec::new(),
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "permission.requested");
        assert!(v.get("run_id").is_none());
        assert!(v.get("suggestions").is_none());
    }
}
