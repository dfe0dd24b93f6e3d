use crate::cache::FileCache;
use crate::error::{Result, ToolError};
use crate::extract::{estimate_tokens, extract_text, whitelisted_extension};
use crate::guard::PathGuard;
use crate::outcome::{FileTokenCost, ToolOutcome};
use crate::traits::{optional_string_list, require_string, Tool, ToolContext, ToolSpec};
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use walkdir::WalkDir;

/// Fixed limits the read tools enforce. The token threshold and the file cap
/// are tuned against the length/4 estimate.
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub context_window_threshold: u64,
    pub max_files_before_selection: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            context_window_threshold: 65_536,
            max_files_before_selection: 64,
        }
    }
}

/// Resolve, whitelist-check, extract and size-check one file, consulting the
/// per-chat cache. Shared by the single-file and recursive read tools.
fn read_whitelisted(
    guard: &PathGuard,
    limits: &SandboxLimits,
    cache: &FileCache,
    ctx: &ToolContext,
    user_path: &str,
) -> Result<(PathBuf, String, u64)> {
    let resolved = guard.resolve(user_path)?;
    if !resolved.is_file() {
        return Err(ToolError::NotFound);
    }
    whitelisted_extension(&resolved)?;

    if let Some((content, tokens)) = cache.get(ctx.chat_id, &resolved) {
        return Ok((resolved, content, tokens));
    }

    let content = extract_text(&resolved)?;
    let tokens = estimate_tokens(&content);
    if tokens > limits.context_window_threshold {
        return Err(ToolError::TooLarge {
            tokens,
            limit: limits.context_window_threshold,
        });
    }
    cache.put(ctx.chat_id, &resolved, content.clone(), tokens);
    Ok((resolved, content, tokens))
}

pub struct ListDirectoryTool {
    guard: Arc<PathGuard>,
}

impl ListDirectoryTool {
    pub fn new(guard: Arc<PathGuard>) -> Self {
        Self { guard }
    }
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "list_directory",
            description: "List files and directories in a path relative to the sandbox root. \
                          The root itself ('.' or '~') cannot be listed.",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let path = require_string(&arguments, "path")?;
        if PathGuard::is_bare_root(&path) {
            return Err(ToolError::RootScope);
        }
        let resolved = self.guard.resolve(&path)?;
        if !resolved.is_dir() {
            return Err(ToolError::NotADirectory);
        }

        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)? {
            let entry = entry?;
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(ToolOutcome::success(serde_json::json!({ "entries": entries })))
    }
}

pub struct ReadFileTool {
    guard: Arc<PathGuard>,
    limits: SandboxLimits,
    cache: Arc<FileCache>,
}

impl ReadFileTool {
    pub fn new(guard: Arc<PathGuard>, limits: SandboxLimits, cache: Arc<FileCache>) -> Self {
        Self {
            guard,
            limits,
            cache,
        }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_file",
            description: "Read the text content of one whitelisted file \
                          (relative to the sandbox root).",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" }
                },
                "required": ["path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let path = require_string(&arguments, "path")?;
        let (_, content, tokens) =
            read_whitelisted(&self.guard, &self.limits, &self.cache, ctx, &path)?;
        Ok(ToolOutcome::success(serde_json::json!({
            "path": path,
            "content": content,
            "tokens": tokens,
        })))
    }
}

pub struct ReadDirectoryTool {
    guard: Arc<PathGuard>,
    limits: SandboxLimits,
    cache: Arc<FileCache>,
}

impl ReadDirectoryTool {
    pub fn new(guard: Arc<PathGuard>, limits: SandboxLimits, cache: Arc<FileCache>) -> Self {
        Self {
            guard,
            limits,
            cache,
        }
    }
}

#[async_trait]
impl Tool for ReadDirectoryTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "read_directory_recursive",
            description: "Read every whitelisted file under a directory (recursively). When the \
                          aggregate is too large, returns per-file token costs so the user can \
                          narrow scope via selected_files. The sandbox root itself cannot be read.",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "path": { "type": "string" },
                    "selected_files": {
                        "type": "array",
                        "items": { "type": "string" }
                    }
                },
                "required": ["path"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let path = require_string(&arguments, "path")?;
        let selected: Option<HashSet<String>> = optional_string_list(&arguments, "selected_files")?
            .map(|files| files.into_iter().collect());

        if PathGuard::is_bare_root(&path) {
            return Err(ToolError::RootScope);
        }
        let resolved = self.guard.resolve(&path)?;
        if !resolved.is_dir() {
            return Err(ToolError::NotADirectory);
        }

        let mut contents = serde_json::Map::new();
        let mut costs: Vec<FileTokenCost> = Vec::new();
        let mut total_tokens: u64 = 0;
        let mut scanned: usize = 0;
        let mut capped = false;

        let walker = WalkDir::new(&resolved)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !is_hidden(e.file_name()));

        for entry in walker {
            let entry = match entry {
                Ok(v) => v,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if whitelisted_extension(entry.path()).is_err() {
                continue;
            }

            scanned += 1;
            if selected.is_none() && scanned > self.limits.max_files_before_selection {
                capped = true;
                break;
            }

            let rel = self.guard.display_path(entry.path());
            if let Some(selected) = &selected {
                if !selected.contains(&rel) {
                    continue;
                }
            }

            match read_whitelisted(&self.guard, &self.limits, &self.cache, ctx, &rel) {
                Ok((_, content, tokens)) => {
                    costs.push(FileTokenCost {
                        path: rel.clone(),
                        tokens,
                        error: None,
                    });
                    contents.insert(rel, serde_json::Value::String(content));
                    total_tokens += tokens;
                }
                Err(e) if selected.is_none() => {
                    costs.push(FileTokenCost {
                        path: rel,
                        tokens: 0,
                        error: Some(e.into_message()),
                    });
                }
                Err(_) => {}
            }
        }

        if selected.is_none() && (total_tokens > self.limits.context_window_threshold || capped) {
            return Ok(ToolOutcome::FileSelectionPending {
                files: costs,
                total_tokens,
            });
        }

        Ok(ToolOutcome::success(serde_json::json!({
            "files": serde_json::Value::Object(contents),
            "total_tokens": total_tokens,
            "file_count": costs.iter().filter(|c| c.error.is_none()).count(),
        })))
    }
}

fn is_hidden(name: &std::ffi::OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}
