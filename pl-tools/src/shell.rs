use crate::error::{Result, ToolError};
use crate::guard::{classify_command, CommandVerdict};
use crate::outcome::ToolOutcome;
use crate::traits::{require_string, Tool, ToolContext, ToolSpec};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use uuid::Uuid;

/// Runs guarded shell commands inside the workspace directory.
///
/// Approved commands are tokenized and executed argv-style; nothing ever
/// passes through a shell interpreter, so operator-injection in a
/// model-authored command has no effect.
pub struct RunCommandTool {
    workspace_dir: PathBuf,
    timeout: Duration,
}

impl RunCommandTool {
    pub fn new(workspace_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            timeout,
        }
    }

    /// Execute an exact command the user already confirmed, bypassing the
    /// classifier for this one invocation. Tokenization still applies.
    #[tracing::instrument(level = "info", skip_all, fields(command = %command))]
    pub async fn run_confirmed(&self, command: &str) -> Result<ToolOutcome> {
        self.spawn_tokenized(command).await
    }

    async fn spawn_tokenized(&self, command: &str) -> Result<ToolOutcome> {
        let tokens = shell_words::split(command)
            .map_err(|e| ToolError::InvalidArguments(format!("unparseable command: {e}")))?;
        let Some((program, args)) = tokens.split_first() else {
            return Err(ToolError::InvalidArguments("empty command".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::Io(e.to_string())),
            // kill_on_drop reaps the child when the future is dropped here.
            Err(_) => return Err(ToolError::Timeout(self.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(ToolError::ProcessFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        Ok(ToolOutcome::success(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
        })))
    }
}

#[async_trait]
impl Tool for RunCommandTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_command",
            description: "Execute a non-interactive terminal command inside the workspace \
                          directory. Cannot be used to write files (mkdir, printf, echo, tee \
                          are blocked); deletes require user confirmation.",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let command = require_string(&arguments, "command")?;
        match classify_command(&command) {
            CommandVerdict::Blocked(reason) => Err(ToolError::CommandBlocked(reason)),
            CommandVerdict::ConfirmationRequired => {
                Ok(ToolOutcome::ConfirmationPending { command })
            }
            CommandVerdict::Approved => self.spawn_tokenized(&command).await,
        }
    }
}

/// Writes a script to a uniquely named temp file in the workspace, runs it
/// with the interpreter, and removes the file on every exit path.
pub struct RunScriptTool {
    workspace_dir: PathBuf,
    timeout: Duration,
    interpreter: String,
}

impl RunScriptTool {
    pub fn new(workspace_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            timeout,
            interpreter: "python3".to_string(),
        }
    }
}

#[async_trait]
impl Tool for RunScriptTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "run_script",
            description: "Execute a Python script string inside the workspace directory.",
            parameters: serde_json::json!({
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "code": { "type": "string" }
                },
                "required": ["code"]
            }),
        }
    }

    #[tracing::instrument(level = "info", skip_all)]
    async fn execute(
        &self,
        _ctx: &ToolContext,
        arguments: serde_json::Value,
    ) -> Result<ToolOutcome> {
        let code = require_string(&arguments, "code")?;
        let script_name = format!("temp_script_{}.py", Uuid::new_v4());
        let script_path = self.workspace_dir.join(&script_name);
        tokio::fs::write(&script_path, code).await?;

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&script_name)
            .current_dir(&self.workspace_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let run = tokio::time::timeout(self.timeout, cmd.output()).await;
        // The temp script is removed before any result is returned.
        let _ = tokio::fs::remove_file(&script_path).await;

        let output = match run {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return Err(ToolError::Io(e.to_string())),
            Err(_) => return Err(ToolError::Timeout(self.timeout.as_secs())),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        if !output.status.success() {
            return Err(ToolError::ProcessFailed {
                exit_code: output.status.code().unwrap_or(-1),
                stdout,
                stderr,
            });
        }
        Ok(ToolOutcome::success(serde_json::json!({
            "stdout": stdout,
            "stderr": stderr,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext {
            chat_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn approved_command_runs_tokenized() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("hello.txt"), "hi").unwrap();

        let tool = RunCommandTool::new(tmp.path(), Duration::from_secs(30));
        let out = tool
            .execute(&ctx(), serde_json::json!({ "command": "ls hello.txt" }))
            .await
            .unwrap();
        match out {
            ToolOutcome::Success { payload } => {
                assert!(payload["stdout"].as_str().unwrap().contains("hello.txt"));
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delete_command_pauses_without_executing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("keep.txt"), "kept").unwrap();

        let tool = RunCommandTool::new(tmp.path(), Duration::from_secs(30));
        let out = tool
            .execute(&ctx(), serde_json::json!({ "command": "rm -rf keep.txt" }))
            .await
            .unwrap();
        assert_eq!(
            out,
            ToolOutcome::ConfirmationPending {
                command: "rm -rf keep.txt".to_string()
            }
        );
        // Nothing ran: the file is untouched until the user confirms.
        assert!(tmp.path().join("keep.txt").exists());
    }

    #[tokio::test]
    async fn confirmed_command_executes_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("gone.txt"), "bye").unwrap();

        let tool = RunCommandTool::new(tmp.path(), Duration::from_secs(30));
        tool.run_confirmed("rm gone.txt").await.unwrap();
        assert!(!tmp.path().join("gone.txt").exists());
    }

    #[tokio::test]
    async fn write_verbs_are_blocked() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(tmp.path(), Duration::from_secs(30));
        let err = tool
            .execute(&ctx(), serde_json::json!({ "command": "mkdir build" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::CommandBlocked(_)));
    }

    #[tokio::test]
    async fn nonzero_exit_carries_partial_output() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(tmp.path(), Duration::from_secs(30));
        let err = tool
            .execute(&ctx(), serde_json::json!({ "command": "ls does-not-exist" }))
            .await
            .unwrap_err();
        match err {
            ToolError::ProcessFailed { exit_code, stderr, .. } => {
                assert_ne!(exit_code, 0);
                assert!(!stderr.is_empty());
            }
            other => panic!("expected process failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = RunCommandTool::new(tmp.path(), Duration::from_millis(100));
        let err = tool
            .execute(&ctx(), serde_json::json!({ "command": "sleep 5" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Timeout(_)));
    }

    #[tokio::test]
    async fn script_runs_and_temp_file_is_removed() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = RunScriptTool::new(tmp.path(), Duration::from_secs(30));
        let out = tool
            .execute(&ctx(), serde_json::json!({ "code": "print(2 + 2)" }))
            .await
            .unwrap();
        match out {
            ToolOutcome::Success { payload } => {
                assert!(payload["stdout"].as_str().unwrap().contains('4'));
            }
            other => panic!("expected success, got {other:?}"),
        }
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn failing_script_still_cleans_up() {
        let tmp = tempfile::tempdir().unwrap();
        let tool = RunScriptTool::new(tmp.path(), Duration::from_secs(30));
        let err = tool
            .execute(&ctx(), serde_json::json!({ "code": "raise SystemExit(3)" }))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::ProcessFailed { exit_code: 3, .. }));
        let leftovers: Vec<_> = std::fs::read_dir(tmp.path()).unwrap().collect();
        assert!(leftovers.is_empty());
    }
}
