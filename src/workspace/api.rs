use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;

use super::models::{SessionKey, SessionSnapshot};
use super::orchestrator::Orchestrator;
use crate::errors::WorkspaceError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub orchestrator: Orchestrator,
}

pub type SharedState = Arc<AppState>;

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct SessionRequest {
    #[serde(flatten)]
    pub key: SessionKey,
}

#[derive(Deserialize)]
pub struct SelectBranchRequest {
    #[serde(flatten)]
    pub key: SessionKey,
    pub branch: String,
}

#[derive(Deserialize)]
pub struct StartPreviewRequest {
    #[serde(flatten)]
    pub key: SessionKey,
    /// Defaults to the acquired working branch.
    pub branch: Option<String>,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

impl From<WorkspaceError> for ApiError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::UnknownSession { .. } => ApiError::NotFound(err.to_string()),
            WorkspaceError::InvalidTransition { .. }
            | WorkspaceError::BranchNotOffered { .. }
            | WorkspaceError::PreviewNotRunning { .. }
            | WorkspaceError::NoBranch { .. } => ApiError::Conflict(err.to_string()),
        }
    }
}

fn validate_key(key: &SessionKey) -> Result<(), ApiError> {
    if key.project_id.trim().is_empty() || key.owner.trim().is_empty() || key.repo.trim().is_empty()
    {
        return Err(ApiError::BadRequest(
            "project_id, owner and repo are required".into(),
        ));
    }
    Ok(())
}

type SnapshotResult = Result<Json<SessionSnapshot>, ApiError>;

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route(
            "/api/sessions/{project_id}/{owner}/{repo}",
            get(get_session),
        )
        .route("/api/sessions/activate", post(activate))
        .route("/api/sessions/close", post(close_session))
        .route("/api/sessions/branch/acquire", post(acquire_branch))
        .route("/api/sessions/branch/select", post(select_branch))
        .route("/api/sessions/branch/cancel", post(cancel_branch))
        .route("/api/sessions/branch/reset", post(reset_branch))
        .route("/api/sessions/preview/start", post(start_preview))
        .route("/api/sessions/preview/stop", post(stop_preview))
        .route("/api/sessions/preview/refresh", post(refresh_preview))
        .route("/api/sessions/preview/reset", post(reset_preview))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_sessions(State(state): State<SharedState>) -> Json<Vec<SessionSnapshot>> {
    Json(state.orchestrator.sessions())
}

async fn get_session(
    State(state): State<SharedState>,
    Path((project_id, owner, repo)): Path<(String, String, String)>,
) -> SnapshotResult {
    let key = SessionKey::new(project_id, owner, repo);
    Ok(Json(state.orchestrator.snapshot(&key)?))
}

async fn activate(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    validate_key(&req.key)?;
    Ok(Json(state.orchestrator.activate(&req.key)))
}

async fn close_session(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.close_session(&req.key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn acquire_branch(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    validate_key(&req.key)?;
    Ok(Json(state.orchestrator.acquire_branch(&req.key)?))
}

async fn select_branch(
    State(state): State<SharedState>,
    Json(req): Json<SelectBranchRequest>,
) -> SnapshotResult {
    Ok(Json(
        state
            .orchestrator
            .select_existing_branch(&req.key, &req.branch)?,
    ))
}

async fn cancel_branch(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    Ok(Json(state.orchestrator.cancel(&req.key)?))
}

async fn reset_branch(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    Ok(Json(state.orchestrator.reset_branch(&req.key)?))
}

async fn start_preview(
    State(state): State<SharedState>,
    Json(req): Json<StartPreviewRequest>,
) -> SnapshotResult {
    validate_key(&req.key)?;
    if req.branch.as_deref().is_some_and(|b| b.trim().is_empty()) {
        return Err(ApiError::BadRequest("branch must not be empty".into()));
    }
    Ok(Json(
        state
            .orchestrator
            .start_preview(&req.key, req.branch.as_deref())?,
    ))
}

async fn stop_preview(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    Ok(Json(state.orchestrator.stop_preview(&req.key)?))
}

async fn refresh_preview(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    Ok(Json(state.orchestrator.refresh(&req.key)?))
}

async fn reset_preview(
    State(state): State<SharedState>,
    Json(req): Json<SessionRequest>,
) -> SnapshotResult {
    Ok(Json(state.orchestrator.reset_preview(&req.key)?))
}
