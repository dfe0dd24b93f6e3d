use thiserror::Error;

pub type Result<T> = std::result::Result<T, ToolError>;

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("path traversal detected or path is invalid")]
    PathTraversal,

    #[error(
        "operating on the entire sandbox root ('.' or '~') is not allowed; \
         specify a subdirectory (e.g. 'Documents/')"
    )]
    RootScope,

    #[error("path does not exist or is not a file")]
    NotFound,

    #[error("path does not exist or is not a directory")]
    NotADirectory,

    #[error("file type {0:?} is not whitelisted")]
    Unwhitelisted(String),

    #[error("content is too large ({tokens} estimated tokens, limit {limit})")]
    TooLarge { tokens: u64, limit: u64 },

    #[error("command blocked: {0}")]
    CommandBlocked(String),

    #[error("timed out after {0} seconds")]
    Timeout(u64),

    #[error("process failed (exit {exit_code})")]
    ProcessFailed {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool {0:?} not found")]
    UnknownTool(String),

    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl ToolError {
    /// Serialized form recorded in the transcript. `ProcessFailed` keeps its
    /// partial output so the synthesis step can react to it.
    pub fn into_message(self) -> String {
        match self {
            Self::ProcessFailed {
                exit_code,
                stdout,
                stderr,
            } => format!(
                "process failed (exit {exit_code})\nstdout:\n{stdout}\nstderr:\n{stderr}"
            ),
            other => other.to_string(),
        }
    }
}
