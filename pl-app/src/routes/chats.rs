use crate::render;
use crate::routes::parse_chat_id;
use crate::server::AppState;
use crate::store::MessageKind;
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use pl_llm::Role;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

pub fn router() -> Router {
    Router::new()
        .route("/api/v1/chats", get(list_chats).post(create_chat))
        .route("/api/v1/chats/{id}", get(get_chat).delete(delete_chat))
        .route("/api/v1/chats/{id}/rename", post(rename_chat))
        .route("/api/v1/chats/{id}/download", get(download_transcript))
}

async fn list_chats(Extension(state): Extension<Arc<AppState>>) -> Response {
    match state.store.list_chats() {
        Ok(chats) => Json(serde_json::json!({ "chats": chats })).into_response(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct CreateChatRequest {
    model: String,
}

async fn create_chat(
    Extension(state): Extension<Arc<AppState>>,
    Json(req): Json<CreateChatRequest>,
) -> Response {
    if !state.config.is_valid_model(&req.model) {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": format!("unknown model {:?}", req.model) })),
        )
            .into_response();
    }

    let chat_id = Uuid::new_v4();
    let greeting = format!(
        "Model selected: <strong>{}</strong>. How can I help?",
        render::escape_html(&req.model)
    );
    let result = state
        .store
        .create_chat(chat_id, "New Chat", &req.model)
        .and_then(|_| {
            state.store.append_message(
                chat_id,
                Role::Model,
                &greeting,
                &format!("Model selected: {}. How can I help?", req.model),
                MessageKind::Chat,
            )
        });
    match result {
        Ok(()) => Json(serde_json::json!({
            "id": chat_id,
            "title": "New Chat",
            "model": req.model,
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn get_chat(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let chat = match state.store.get_chat(chat_id) {
        Ok(Some(chat)) => chat,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };
    match state.store.messages_for_chat(chat_id) {
        Ok(messages) => Json(serde_json::json!({
            "chat": chat,
            "messages": messages,
            "has_active_plan": state.engine.has_active_plan(chat_id),
        }))
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn delete_chat(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    // Drop any in-flight plan with the chat.
    let _ = state.engine.cancel_plan(chat_id).await;
    match state.store.delete_chat(chat_id) {
        Ok(true) => Json(serde_json::json!({ "status": "deleted" })).into_response(),
        Ok(false) => not_found(),
        Err(e) => internal_error(e),
    }
}

#[derive(Deserialize)]
struct RenameRequest {
    title: String,
}

async fn rename_chat(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let title = req.title.trim();
    if title.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "title must not be empty" })),
        )
            .into_response();
    }
    match state.store.get_chat(chat_id) {
        Ok(Some(_)) => {}
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    }
    match state.store.set_title(chat_id, title) {
        Ok(()) => Json(serde_json::json!({ "status": "renamed", "title": title })).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn download_transcript(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    let chat = match state.store.get_chat(chat_id) {
        Ok(Some(chat)) => chat,
        Ok(None) => return not_found(),
        Err(e) => return internal_error(e),
    };
    let messages = match state.store.messages_for_chat(chat_id) {
        Ok(messages) => messages,
        Err(e) => return internal_error(e),
    };
    let body = render::transcript_text(&chat, &messages);
    (
        [
            (header::CONTENT_TYPE, "text/plain; charset=utf-8".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"chat-{chat_id}.txt\""),
            ),
        ],
        body,
    )
        .into_response()
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "chat not found" })),
    )
        .into_response()
}

pub(crate) fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": e.to_string() })),
    )
        .into_response()
}
