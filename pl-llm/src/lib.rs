//! Generation-backend client for Planloom.
//!
//! One request/response call per turn; no tool-use protocol lives here.
//! The agent engine consumes the [`GenerationBackend`] trait so tests can
//! substitute a scripted backend.

mod error;
mod gemini;
mod types;

pub use error::{LlmError, Result};
pub use gemini::GeminiClient;
pub use types::{ChatMessage, Generation, Role};

use async_trait::async_trait;

#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Issue one generation call: prior turns plus the new prompt.
    async fn generate(
        &self,
        model: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<Generation>;
}
