use crate::error::{LlmError, Result};
use crate::types::{ChatMessage, Generation, Role};
use crate::GenerationBackend;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Clone)]
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(%e, "reqwest client build failed; falling back to default client");
                reqwest::Client::new()
            });
        Self {
            http,
            api_key: api_key.to_string(),
            base_url: GEMINI_BASE_URL.to_string(),
        }
    }

    /// Point the client at a different endpoint (local test servers).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl GenerationBackend for GeminiClient {
    #[tracing::instrument(level = "info", skip_all, fields(model = %model))]
    async fn generate(
        &self,
        model: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<Generation> {
        let req = GenerateRequest::new(history, prompt);
        let url = format!("{}/{}:generateContent", self.base_url, model);

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&req)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if !status.is_success() {
            return Err(LlmError::Http(format!(
                "gemini generate status={status} body={body}"
            )));
        }

        let parsed: GenerateResponse = serde_json::from_str(&body)?;
        parsed.into_generation()
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

impl GenerateRequest {
    fn new(history: &[ChatMessage], prompt: &str) -> Self {
        let mut contents: Vec<Content> = history.iter().map(Content::from_message).collect();
        contents.push(Content {
            role: "user".to_string(),
            parts: vec![Part {
                text: prompt.to_string(),
            }],
        });
        Self { contents }
    }
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

impl Content {
    fn from_message(message: &ChatMessage) -> Self {
        Self {
            role: match message.role {
                Role::User => "user".to_string(),
                Role::Model => "model".to_string(),
            },
            parts: vec![Part {
                text: message.text.clone(),
            }],
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default, rename = "promptFeedback")]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct PromptFeedback {
    #[serde(default, rename = "blockReason")]
    block_reason: Option<String>,
}

impl GenerateResponse {
    fn into_generation(self) -> Result<Generation> {
        let Some(candidate) = self.candidates.into_iter().next() else {
            // No candidate at all means the prompt itself was refused.
            let reason = self
                .prompt_feedback
                .and_then(|f| f.block_reason)
                .unwrap_or_else(|| "UNKNOWN".to_string());
            return Ok(Generation::Blocked { reason });
        };

        if candidate.finish_reason.as_deref() == Some("SAFETY") {
            return Ok(Generation::Blocked {
                reason: "SAFETY".to_string(),
            });
        }

        let text = candidate
            .content
            .map(|c| {
                c.parts
                    .into_iter()
                    .map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.is_empty() {
            return Err(LlmError::ResponseFormat(
                "candidate carried no text parts".to_string(),
            ));
        }
        Ok(Generation::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_text_is_concatenated_from_parts() {
        let body = r#"{
            "candidates": [
                {
                    "content": { "parts": [{ "text": "Hello" }, { "text": ", world" }] },
                    "finishReason": "STOP"
                }
            ]
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.into_generation().unwrap(),
            Generation::Text("Hello, world".to_string())
        );
    }

    #[test]
    fn safety_finish_reason_maps_to_blocked() {
        let body = r#"{
            "candidates": [
                { "content": { "parts": [{ "text": "partial" }] }, "finishReason": "SAFETY" }
            ]
        }"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.into_generation().unwrap(),
            Generation::Blocked {
                reason: "SAFETY".to_string()
            }
        );
    }

    #[test]
    fn missing_candidates_surface_prompt_block_reason() {
        let body = r#"{ "promptFeedback": { "blockReason": "PROHIBITED_CONTENT" } }"#;
        let parsed: GenerateResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            parsed.into_generation().unwrap(),
            Generation::Blocked {
                reason: "PROHIBITED_CONTENT".to_string()
            }
        );
    }

    #[test]
    fn request_appends_prompt_after_history() {
        let history = vec![
            ChatMessage::new(Role::User, "hi"),
            ChatMessage::new(Role::Model, "hello"),
        ];
        let req = GenerateRequest::new(&history, "next");
        assert_eq!(req.contents.len(), 3);
        assert_eq!(req.contents[1].role, "model");
        assert_eq!(req.contents[2].parts[0].text, "next");
    }
}
