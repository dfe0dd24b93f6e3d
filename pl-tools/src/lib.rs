//! Sandboxed tool set for the Planloom agent.
//!
//! Every tool is a named, schema-described operation dispatched by the plan
//! executor. Filesystem and process access goes through the path/command
//! guard; there is no bypass path.

mod cache;
mod error;
mod extract;
mod filesystem;
mod guard;
mod outcome;
mod registry;
mod shell;
mod traits;
mod workspace;

pub use cache::FileCache;
pub use error::{Result, ToolError};
pub use extract::{estimate_tokens, extract_text, whitelisted_extension, WHITELISTED_EXTENSIONS};
pub use filesystem::{ListDirectoryTool, ReadDirectoryTool, ReadFileTool, SandboxLimits};
pub use guard::{classify_command, CommandVerdict, PathGuard};
pub use outcome::{FileTokenCost, ToolOutcome};
pub use registry::ToolRegistry;
pub use shell::{RunCommandTool, RunScriptTool};
pub use traits::{Tool, ToolContext, ToolSpec};
pub use workspace::{AppendFileTool, DeleteFileTool, EditExistingFileTool, SaveFileTool};
