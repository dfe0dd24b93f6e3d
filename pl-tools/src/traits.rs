use crate::error::{Result, ToolError};
use crate::outcome::ToolOutcome;
use async_trait::async_trait;
use uuid::Uuid;

/// Name, description and declared parameter shape of one tool. The planner
/// prompt consumes this verbatim via [`crate::ToolRegistry::manifest`].
pub struct ToolSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: serde_json::Value,
}

/// Dispatch-time context. The read cache is scoped per chat, so tools that
/// consult it need to know which chat is executing.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub chat_id: Uuid,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn spec(&self) -> ToolSpec;
    async fn execute(&self, ctx: &ToolContext, arguments: serde_json::Value)
        -> Result<ToolOutcome>;
}

pub(crate) fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub(crate) fn optional_string_list(
    args: &serde_json::Value,
    key: &str,
) -> Result<Option<Vec<String>>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                match item {
                    serde_json::Value::String(s) => out.push(s.clone()),
                    other => {
                        return Err(ToolError::InvalidArguments(format!(
                            "key {key} must be a list of strings, got element {other:?}"
                        )));
                    }
                }
            }
            Ok(Some(out))
        }
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be a list of strings, got {other:?}"
        ))),
    }
}
