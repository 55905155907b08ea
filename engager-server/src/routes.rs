//! HTTP route handlers for the run-control API.

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use engager::controller::RunStatus;
use engager::core::selector::{QueueSummary, summarize};
use engager::core::types::{RunState, Session};
use engager::error::ControlError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::state::AppState;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/resume", post(resume))
        .route("/reset", post(reset))
        .route("/sessions", get(list_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
}

/// Control error rendered as `{"error": "<Code>"}`.
pub struct ApiError(ControlError);

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        Self(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self(ControlError::from(err))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            ControlError::NoSession(_) => StatusCode::NOT_FOUND,
            ControlError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::CONFLICT,
        };
        warn!(code = self.0.code(), "control request rejected: {}", self.0);
        (status, Json(json!({ "error": self.0.code() }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

/// GET /api/status - current run state and active session.
async fn get_status(State(state): State<AppState>) -> Json<RunStatus> {
    Json(state.controller.status())
}

#[derive(Deserialize)]
struct StartRequest {
    session_id: String,
}

/// POST /api/start - start a run over `session_id`.
async fn start(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> Result<Json<RunStatus>, ApiError> {
    state.controller.start(&request.session_id)?;
    info!(session_id = %request.session_id, "run started");
    Ok(Json(state.controller.status()))
}

/// POST /api/stop - pause after the in-flight step.
async fn stop(State(state): State<AppState>) -> Result<Json<RunStatus>, ApiError> {
    state.controller.stop()?;
    Ok(Json(state.controller.status()))
}

/// POST /api/resume - continue a paused run.
async fn resume(State(state): State<AppState>) -> Result<Json<RunStatus>, ApiError> {
    state.controller.resume()?;
    Ok(Json(state.controller.status()))
}

/// POST /api/reset - back to idle, items untouched.
async fn reset(State(state): State<AppState>) -> Result<Json<RunStatus>, ApiError> {
    state.controller.reset()?;
    Ok(Json(state.controller.status()))
}

#[derive(Serialize)]
struct SessionEntry {
    session_id: String,
    run_state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    summary: QueueSummary,
}

/// GET /api/sessions - every known session with its queue summary.
async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionEntry>> {
    let store = state.controller.store();
    let entries = store
        .session_ids()
        .iter()
        .filter_map(|id| store.get(id))
        .map(|session| SessionEntry {
            summary: summarize(&session),
            session_id: session.session_id,
            run_state: session.run_state,
            title: session.title,
        })
        .collect();
    Json(entries)
}

/// GET /api/sessions/{id} - the full session record.
async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Session>, ApiError> {
    state
        .controller
        .store()
        .load(&id)?
        .map(Json)
        .ok_or(ApiError(ControlError::NoSession(id)))
}

/// DELETE /api/sessions/{id} - remove a session that is not being run.
async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.controller.clear_session(&id)?;
    info!(session_id = %id, "session cleared");
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use engager::core::types::Relation;
    use engager::test_support::{Harness, ScriptedActuator, done_item, item, session_with};
    use serde_json::Value;
    use std::sync::Arc;
    use tokio::sync::Semaphore;
    use tower::ServiceExt;

    fn app(harness: &Harness) -> (Router, AppState) {
        let state = AppState::new(harness.controller());
        let router = Router::new()
            .nest("/api", api_router())
            .with_state(state.clone());
        (router, state)
    }

    async fn send(
        router: Router,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request");
        let response = router.oneshot(request).await.expect("response");
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn status_reports_idle_controller() {
        let harness = Harness::new();
        let (router, _) = app(&harness);

        let (status, body) = send(router, "GET", "/api/status", None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_state"], "idle");
        assert_eq!(body["active_session_id"], Value::Null);
    }

    #[tokio::test]
    async fn start_unknown_session_is_not_found() {
        let harness = Harness::new();
        let (router, _) = app(&harness);

        let (status, body) = send(
            router,
            "POST",
            "/api/start",
            Some(json!({ "session_id": "missing" })),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "NoSession" }));
    }

    #[tokio::test]
    async fn second_start_conflicts_without_touching_items() {
        let gate = Arc::new(Semaphore::new(0));
        let mut first = item("a");
        first.origin_relation = Relation::Unrelated;
        let harness = Harness::new()
            .with_actuator(ScriptedActuator::new().with_primary_gate(Arc::clone(&gate)));
        harness.seed(session_with(vec![first]));
        let (router, state) = app(&harness);

        let (status, body) = send(
            router.clone(),
            "POST",
            "/api/start",
            Some(json!({ "session_id": "session-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_state"], "running");

        let before = harness.session("session-1").items;
        let (status, body) = send(
            router,
            "POST",
            "/api/start",
            Some(json!({ "session_id": "session-1" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "AlreadyRunning");
        assert_eq!(harness.session("session-1").items.len(), before.len());

        state.controller.stop().expect("stop");
        gate.add_permits(1);
        state.controller.join().await;
    }

    #[tokio::test]
    async fn stop_and_resume_require_matching_state() {
        let harness = Harness::new();
        let (router, _) = app(&harness);

        let (status, body) = send(router.clone(), "POST", "/api/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "NotRunning");

        let (status, body) = send(router.clone(), "POST", "/api/resume", None).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"], "NotPaused");

        let (status, body) = send(router, "POST", "/api/reset", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["run_state"], "idle");
    }

    #[tokio::test]
    async fn sessions_can_be_listed_fetched_and_deleted() {
        let harness = Harness::new();
        harness.seed(session_with(vec![
            done_item("a", Relation::Related),
            item("b"),
        ]));
        let (router, _) = app(&harness);

        let (status, body) = send(router.clone(), "GET", "/api/sessions", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["session_id"], "session-1");
        assert_eq!(body[0]["summary"]["total"], 2);
        assert_eq!(body[0]["summary"]["complete"], 1);

        let (status, body) = send(router.clone(), "GET", "/api/sessions/session-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["items"][1]["item_id"], "b");

        let (status, _) = send(router.clone(), "DELETE", "/api/sessions/session-1", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, body) = send(router, "GET", "/api/sessions/session-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "NoSession");
    }
}
