//! Write-side tools, scoped to the workspace directory.
//!
//! Filenames are reduced to their basename so nested-path arguments cannot
//! escape the workspace. Create vs. edit is an enforced two-tool
//! distinction: `save_file` is the only way to create, `edit_existing_file`
//! the only way to overwrite.

use crate::error::{Result, ToolError};
use crate::outcome::ToolOutcome;
use crate::traits::{require_string, Tool, ToolContext, ToolSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

fn workspace_file(workspace_dir: &Path, filename: &str) -> Result<(String, PathBuf)> {
    let name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.is_empty() && n != "." && n != "..")
        .ok_or_else(|| {
            ToolError::InvalidArguments(format!("filename {filename:?} has no basename"))
        })?;
    let path = workspace_dir.join(&name);
    Ok((name, path))
}

fn file_params() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "additionalProperties": false,
        "properties": {
            "filename": { "type": "string" },
            "content": { "type": "string" }
        },
        "required": ["filename", "content"]
    })
}

pub struct SaveFileTool {
    workspace_dir: PathBuf,
}

impl SaveFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for SaveFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "save_file",
            description: "Save text to a NEW file inside the workspace directory. \
                          This is the only tool for creating files.",
            parameters: file_params(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let filename = require_string(&arguments, "filename")?;
        let content = require_string(&arguments, "content")?;
        let (name, path) = workspace_file(&self.workspace_dir, &filename)?;
        tokio::fs::write(&path, content).await?;
        Ok(ToolOutcome::success(serde_json::json!({ "path": name })))
    }
}

pub struct EditExistingFileTool {
    workspace_dir: PathBuf,
}

impl EditExistingFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for EditExistingFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "edit_existing_file",
            description: "Overwrite an EXISTING file inside the workspace directory. \
                          Fails if the file does not exist; use save_file to create it first.",
            parameters: file_params(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let filename = require_string(&arguments, "filename")?;
        let content = require_string(&arguments, "content")?;
        let (name, path) = workspace_file(&self.workspace_dir, &filename)?;
        if !path.is_file() {
            return Err(ToolError::NotFound);
        }
        tokio::fs::write(&path, content).await?;
        Ok(ToolOutcome::success(serde_json::json!({ "path": name })))
    }
}

pub struct AppendFileTool {
    workspace_dir: PathBuf,
}

impl AppendFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for AppendFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "append_file",
            description: "Append text to an EXISTING file inside the workspace directory. \
                          Fails if the file does not exist.",
            parameters: file_params(),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let filename = require_string(&arguments, "filename")?;
        let content = require_string(&arguments, "content")?;
        let (name, path) = workspace_file(&self.workspace_dir, &filename)?;
        if !path.is_file() {
            return Err(ToolError::NotFound);
        }
        let mut existing = tokio::fs::read_to_string(&path).await?;
        existing.push_str(&content);
        tokio::fs::write(&path, existing).await?;
        Ok(ToolOutcome::success(serde_json::json!({ "path": name })))
    }
}

pub struct DeleteFileTool {
    workspace_dir: PathBuf,
}

impl DeleteFileTool {
    pub fn new(workspace_dir: impl Into<PathBuf>) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
        }
    }
}

#[async_trait]
impl Tool for DeleteFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "delete_file",
            description: "Delete one file inside the workspace directory.",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "filename": { "type": "string" }
                },
                "required": ["filename"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let filename = require_string(&arguments, "filename")?;
        let (name, path) = workspace_file(&self.workspace_dir, &filename)?;
        if !path.is_file() {
            return Err(ToolError::NotFound);
        }
        tokio::fs::remove_file(&path).await?;
        Ok(ToolOutcome::success(serde_json::json!({ "deleted": name })))
    }
}
