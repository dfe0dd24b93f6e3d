use crate::error::{Result, ToolError};
use crate::outcome::ToolOutcome;
use crate::traits::{Tool, ToolContext};
use std::collections::HashMap;
use std::sync::Arc;

/// Fixed registry of named tools. The executor dispatches through it; the
/// planner prompt embeds its manifest verbatim.
#[derive(Default)]
pub struct ToolRegistry {
    order: Vec<&'static str>,
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.spec().name;
        if self.tools.insert(name, tool).is_none() {
            self.order.push(name);
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Serialized tool list (registration order) for prompt construction.
    pub fn manifest(&self) -> serde_json::Value {
        let specs: Vec<serde_json::Value> = self
            .order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                let spec = tool.spec();
                serde_json::json!({
                    "name": spec.name,
                    "description": spec.description,
                    "parameters": spec.parameters,
                })
            })
            .collect();
        serde_json::Value::Array(specs)
    }

    /// Dispatch one call. An unknown tool name is an error, never a silent
    /// no-op; tool-level failures come back as `Err` for the caller to fold
    /// into the transcript.
    pub async fn dispatch(
        &self,
        name: &str,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let Some(tool) = self.get(name) else {
            return Err(ToolError::UnknownTool(name.to_string()));
        };
        tool.execute(ctx, arguments).await
    }
}
