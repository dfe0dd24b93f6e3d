mod chats;
mod health;
mod messages;
mod plan;

use axum::Router;

pub fn router() -> Router {
    Router::new()
        .merge(health::router())
        .merge(chats::router())
        .merge(messages::router())
        .merge(plan::router())
}

/// Shared guard for `{id}` path segments.
pub(crate) fn parse_chat_id(raw: &str) -> Result<uuid::Uuid, axum::Json<serde_json::Value>> {
    uuid::Uuid::parse_str(raw)
        .map_err(|_| axum::Json(serde_json::json!({ "error": "invalid chat id" })))
}
