use crate::agent::StepOutcome;
use crate::routes::chats::internal_error;
use crate::routes::parse_chat_id;
use crate::server::AppState;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/api/v1/chats/{id}/plan", post(approve_plan).delete(cancel_plan))
        .route("/api/v1/chats/{id}/plan/execute", post(execute_step))
        .route("/api/v1/chats/{id}/plan/confirm", post(confirm_command))
        .route("/api/v1/chats/{id}/plan/select", post(select_files))
}

fn chat_id_or_reject(id: &str) -> Result<Uuid, Response> {
    parse_chat_id(id).map_err(|e| (StatusCode::BAD_REQUEST, e).into_response())
}

fn step_outcome_response(outcome: StepOutcome) -> Response {
    let body = match outcome {
        StepOutcome::Proceed => serde_json::json!({ "status": "proceed" }),
        StepOutcome::PausedForConfirmation { command } => serde_json::json!({
            "status": "confirmation_pending",
            "command": command,
        }),
        StepOutcome::PausedForFileSelection {
            files,
            total_tokens,
        } => serde_json::json!({
            "status": "file_selection_pending",
            "files": files,
            "total_tokens": total_tokens,
        }),
        StepOutcome::Completed { message } => serde_json::json!({
            "status": "completed",
            "message": message,
        }),
        StepOutcome::Failed { message } => serde_json::json!({
            "status": "failed",
            "message": message,
        }),
    };
    Json(body).into_response()
}

#[derive(Deserialize)]
struct ApprovePlanRequest {
    plan_json: String,
}

/// Approve (possibly after editing) the plan document for this chat.
async fn approve_plan(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ApprovePlanRequest>,
) -> Response {
    let chat_id = match chat_id_or_reject(&id) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match state.engine.approve_plan(chat_id, &req.plan_json).await {
        Ok(()) => Json(serde_json::json!({ "status": "approved" })).into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn execute_step(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match chat_id_or_reject(&id) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match state.engine.execute_step(chat_id).await {
        Ok(outcome) => step_outcome_response(outcome),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct ConfirmRequest {
    approved: bool,
}

async fn confirm_command(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<ConfirmRequest>,
) -> Response {
    let chat_id = match chat_id_or_reject(&id) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match state.engine.resolve_confirmation(chat_id, req.approved).await {
        Ok(outcome) => step_outcome_response(outcome),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct SelectFilesRequest {
    files: Vec<String>,
}

async fn select_files(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SelectFilesRequest>,
) -> Response {
    let chat_id = match chat_id_or_reject(&id) {
        Ok(v) => v,
        Err(r) => return r,
    };
    if req.files.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "select at least one file" })),
        )
            .into_response();
    }
    match state.engine.resolve_selection(chat_id, req.files).await {
        Ok(outcome) => step_outcome_response(outcome),
        Err(e) => (
            StatusCode::CONFLICT,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn cancel_plan(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match chat_id_or_reject(&id) {
        Ok(v) => v,
        Err(r) => return r,
    };
    match state.engine.cancel_plan(chat_id).await {
        Ok(true) => Json(serde_json::json!({ "status": "cancelled" })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no active plan" })),
        )
            .into_response(),
        Err(e) => internal_error(e),
    }
}
