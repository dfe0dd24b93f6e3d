use crate::routes::chats::internal_error;
use crate::routes::parse_chat_id;
use crate::server::AppState;
use crate::store::MessageKind;
use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use std::sync::Arc;

pub fn router() -> Router {
    Router::new().route("/api/v1/chats/{id}/messages", post(send_message))
}

#[derive(Deserialize)]
struct SendMessageRequest {
    prompt: String,
    #[serde(default)]
    agent_mode: bool,
}

/// One prompt turn. A conversational reply comes back directly; a proposed
/// plan comes back with the editable document and the actions the client
/// may take on it.
async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Response {
    let chat_id = match parse_chat_id(&id) {
        Ok(v) => v,
        Err(e) => return (StatusCode::BAD_REQUEST, e).into_response(),
    };
    if req.prompt.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": "prompt must not be empty" })),
        )
            .into_response();
    }

    match state
        .engine
        .handle_prompt(chat_id, &req.prompt, req.agent_mode)
        .await
    {
        Ok(reply) => {
            let mut body = serde_json::json!({
                "role": "model",
                "content": reply.content,
                "message_type": reply.kind,
            });
            if reply.kind == MessageKind::AgentPlan {
                body["raw_plan"] = serde_json::json!(reply.raw_plan);
                body["actions"] = serde_json::json!(["approve", "edit", "cancel"]);
            }
            Json(body).into_response()
        }
        Err(e) => internal_error(e),
    }
}
