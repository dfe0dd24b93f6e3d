use serde::{Deserialize, Serialize};

/// Per-file token cost reported when a recursive read needs the user to
/// narrow scope before any content is returned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTokenCost {
    pub path: String,
    pub tokens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of exactly one tool dispatch.
///
/// Pauses (`ConfirmationPending`, `FileSelectionPending`) are not failures:
/// the executor holds the cursor and waits for an explicit user action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolOutcome {
    Success {
        payload: serde_json::Value,
    },
    Error {
        message: String,
    },
    ConfirmationPending {
        command: String,
    },
    FileSelectionPending {
        files: Vec<FileTokenCost>,
        total_tokens: u64,
    },
}

impl ToolOutcome {
    pub fn success(payload: serde_json::Value) -> Self {
        Self::Success { payload }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}
