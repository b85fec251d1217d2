//! HTTP route handlers and router assembly.
//!
//! All handlers except [`health`] and the WebSocket upgrade require
//! authentication via the [`crate::auth::require_api_key`] middleware.

pub mod health;
pub mod permissions;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use tower_http::trace::TraceLayer;

use crate::auth::{self, ApiKey};
use crate::{ws, AppState};

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let public_routes = Router::new().route("/api/health", get(health::health));

    let authed_routes = Router::new()
        .route("/api/permissions", post(permissions::request_permission))
        .route("/api/runs/{run_id}/end", post(permissions::end_run))
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_route = Router::new().route("/api/ws", get(ws::ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::UiEvent;
    use crate::permissions::{PermissionResponse, NO_BOUNDARY_MESSAGE, RUN_ENDED_MESSAGE};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> AppState {
        let mut config = Config::default();
        config.auth.api_key = "test-key".into();
        config.sessions.shell = "/bin/sh".into();
        config.sessions.pty = false;
        AppState::new(config)
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer test-key")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(resp: axum::response::Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_is_public() {
        let app = router(state());
        let resp = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["sessions"], 0);
        assert_eq!(body["pending_permissions"], 0);
    }

    #[tokio::test]
    async fn test_permissions_require_auth() {
        let app = router(state());
        let req = Request::builder()
            .method("POST")
            .uri("/api/runs/r1/end")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_permission_without_ui_is_denied() {
        let app = router(state());
        let resp = app
            .oneshot(post_json(
                "/api/permissions",
                &json!({"tool_name": "Bash", "input": {"command": "ls"}, "tool_use_id": "toolu_1"}),
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["tool_use_id"], "toolu_1");
        assert_eq!(body["behavior"], "deny");
        assert_eq!(body["message"], NO_BOUNDARY_MESSAGE);
    }

    #[tokio::test]
    async fn test_permission_long_poll_returns_ui_answer() {
        let state = state();
        let mut ui = state.events.subscribe();
        let app = router(state.clone());

        let call = tokio::spawn(app.oneshot(post_json(
            "/api/permissions",
            &json!({"tool_name": "Write", "input": {"path": "a.txt"}, "tool_use_id": "toolu_7"}),
        )));

        let permission_id = loop {
            if let UiEvent::PermissionRequested { permission_id, .. } = ui.recv().await.unwrap() {
                break permission_id;
            }
        };
        let mut answer = PermissionResponse::allow();
        answer.updated_input = Some(json!({"path": "b.txt"}));
        assert!(state.broker.resolve(&permission_id, answer).await);

        let resp = call.await.unwrap().unwrap();
        let body = body_json(resp).await;
        assert_eq!(body["behavior"], "allow");
        assert_eq!(body["updated_input"]["path"], "b.txt");
    }

    #[tokio::test]
    async fn test_dropped_long_poll_cancels_request() {
        let state = state();
        let mut ui = state.events.subscribe();
        let app = router(state.clone());

        let call = tokio::spawn(app.oneshot(post_json(
            "/api/permissions",
            &json!({"tool_name": "Bash", "tool_use_id": "toolu_2"}),
        )));
        loop {
            if matches!(ui.recv().await.unwrap(), UiEvent::PermissionRequested { .. }) {
                break;
            }
        }
        assert_eq!(state.broker.pending_count().await, 1);

        // Simulates the HTTP client going away.
        call.abort();
        let _ = call.await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while state.broker.pending_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("pending request was not cancelled");
    }

    #[tokio::test]
    async fn test_end_run_denies_pending() {
        let state = state();
        let mut ui = state.events.subscribe();
        let app = router(state.clone());

        let call = tokio::spawn(app.clone().oneshot(post_json(
            "/api/permissions",
            &json!({"tool_name": "Bash", "tool_use_id": "toolu_3", "run_id": "run-9"}),
        )));
        loop {
            if matches!(ui.recv().await.unwrap(), UiEvent::PermissionRequested { .. }) {
                break;
            }
        }

        let resp = app
            .oneshot(post_json("/api/runs/run-9/end", &json!({})))
            .await
            .unwrap();
        assert_eq!(body_json(resp).await["denied"], 1);

        let body = body_json(call.await.unwrap().unwrap()).await;
        assert_eq!(body["behavior"], "deny");
        assert_eq!(body["message"], RUN_ENDED_MESSAGE);
    }
}
