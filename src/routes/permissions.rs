//! Task-runner endpoints: permission long-poll and run teardown.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::error;

use crate::permissions::{PermissionRequest, PermissionResult};
use crate::AppState;

/// `POST /api/permissions`: ask the operator and hold the request open until
/// the decision arrives.
///
/// The broker wait runs in its own task. If the client disconnects, axum drops
/// this handler, the drop guard cancels the token and the broker denies and
/// removes the pending entry.
pub async fn request_permission(
    State(state): State<AppState>,
    Json(req): Json<PermissionRequest>,
) -> Result<Json<PermissionResult>, (StatusCode, Json<Value>)> {
    let cancel = CancellationToken::new();
    let broker = state.broker.clone();
    let token = cancel.clone();
    let wait = tokio::spawn(async move { broker.request(req, token).await });
    let _guard = cancel.drop_guard();

    match wait.await {
        Ok(result) => Ok(Json(result)),
        Err(e) => {
            error!("Permission wait task failed: {e}");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Permission request failed"})),
            ))
        }
    }
}

/// `POST /api/runs/{run_id}/end`: deny everything still pending for a run.
pub async fn end_run(State(state): State<AppState>, Path(run_id): Path<String>) -> Json<Value> {
    let denied = state.broker.end_run(&run_id).await;
    Json(json!({"run_id": run_id, "denied": denied}))
}
