use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Model => "model",
        }
    }
}

/// One prior turn fed back into a generation call. Plain text only: the
/// caller is responsible for never handing rendered markup to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }
}

/// Outcome of one generation call. A safety block is a distinct,
/// non-retriable outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Text(String),
    Blocked { reason: String },
}
