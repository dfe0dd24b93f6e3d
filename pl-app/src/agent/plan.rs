//! Plan document parsing.
//!
//! The planner must answer with a single JSON object of the shape
//! `{"plan": [{"step": 1, "tool": "...", "parameters": {...},
//! "reasoning": "..."}]}`. Models habitually wrap that in a markdown code
//! fence, so the fence is stripped before parsing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    #[serde(default)]
    pub step: u32,
    pub tool: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Error)]
pub enum PlanParseError {
    #[error("plan is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("plan object has no \"plan\" key")]
    MissingPlanKey,
    #[error("\"plan\" is not a list of steps")]
    NotAList,
}

/// Remove a leading/trailing markdown code fence if present.
pub fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json") on the opening fence line.
    let rest = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

pub fn parse_plan(raw: &str) -> Result<Vec<PlanStep>, PlanParseError> {
    let body = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(body)?;
    let plan = value.get("plan").ok_or(PlanParseError::MissingPlanKey)?;
    if !plan.is_array() {
        return Err(PlanParseError::NotAList);
    }
    let steps: Vec<PlanStep> = serde_json::from_value(plan.clone())?;
    Ok(steps)
}

/// Canonical pretty form of a plan, used as the stored raw text so an
/// edited plan round-trips through the approval endpoint unchanged.
pub fn plan_to_pretty_json(steps: &[PlanStep]) -> String {
    let doc = serde_json::json!({ "plan": steps });
    serde_json::to_string_pretty(&doc).unwrap_or_else(|_| doc.to_string())
}
