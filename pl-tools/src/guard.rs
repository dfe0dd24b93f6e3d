use crate::error::{Result, ToolError};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;

static CONFIRM_VERBS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\brm\b").expect("delete verb pattern should compile"));
static WRITE_VERBS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(mkdir|printf|echo|tee)\b").expect("write verb pattern should compile")
});

/// Verdict of the command guard. Approved commands are still tokenized and
/// executed argv-style, never handed to a shell interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandVerdict {
    Blocked(String),
    ConfirmationRequired,
    Approved,
}

/// Classify a shell command before execution.
///
/// Root-destroying flags are blocked outright; recursive/forced delete verbs
/// require an explicit human confirmation; file-writing verbs are redirected
/// to the file tools so all writes stay observable.
pub fn classify_command(command: &str) -> CommandVerdict {
    if command.contains("--no-preserve-root") {
        return CommandVerdict::Blocked("--no-preserve-root is forbidden".to_string());
    }
    if CONFIRM_VERBS.is_match(command) {
        return CommandVerdict::ConfirmationRequired;
    }
    if WRITE_VERBS.is_match(command) {
        return CommandVerdict::Blocked(format!(
            "command {command:?} writes files; use save_file or edit_existing_file instead"
        ));
    }
    CommandVerdict::Approved
}

/// Confines filesystem access to a single root directory.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// The root must exist; it is canonicalized once so later containment
    /// checks compare canonical forms.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// True for paths that name the sandbox root itself. Directory tools
    /// reject these to force the model to scope its reads.
    pub fn is_bare_root(path: &str) -> bool {
        matches!(path.trim(), "" | "." | "./" | "~" | "~/")
    }

    /// Normalize a possibly `~`-relative or relative path against the root
    /// and return it only if it still lives under the root once symlinks are
    /// resolved. Everything else is `PathTraversal`.
    pub fn resolve(&self, user_path: &str) -> Result<PathBuf> {
        let trimmed = user_path.trim();
        let rel = trimmed
            .strip_prefix("~/")
            .or_else(|| trimmed.strip_prefix('~'))
            .unwrap_or(trimmed);

        let raw = Path::new(rel);
        let candidate = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        let normalized = lexical_normalize(&candidate)?;

        // Canonicalize the deepest existing ancestor so symlink escapes are
        // caught even when the tail does not exist yet.
        let mut existing = normalized.clone();
        while !existing.exists() {
            if !existing.pop() {
                return Err(ToolError::PathTraversal);
            }
        }
        let canonical = existing.canonicalize()?;
        if !canonical.starts_with(&self.root) {
            return Err(ToolError::PathTraversal);
        }

        Ok(normalized)
    }

    /// Path relative to the root, for user-facing listings.
    pub fn display_path(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .to_string()
    }
}

/// Fold `.` and `..` components without touching the filesystem. Popping
/// past the start of the path is a traversal attempt.
fn lexical_normalize(path: &Path) -> Result<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    return Err(ToolError::PathTraversal);
                }
            }
            Component::RootDir | Component::Prefix(_) | Component::Normal(_) => {
                out.push(component.as_os_str());
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> (tempfile::TempDir, PathGuard) {
        let tmp = tempfile::tempdir().unwrap();
        let guard = PathGuard::new(tmp.path()).unwrap();
        (tmp, guard)
    }

    #[test]
    fn resolve_joins_relative_paths_under_root() {
        let (tmp, guard) = guard();
        std::fs::create_dir(tmp.path().join("docs")).unwrap();
        let resolved = guard.resolve("docs").unwrap();
        assert!(resolved.starts_with(guard.root()));
    }

    #[test]
    fn resolve_expands_tilde_against_root() {
        let (tmp, guard) = guard();
        std::fs::create_dir(tmp.path().join("notes")).unwrap();
        let resolved = guard.resolve("~/notes").unwrap();
        assert_eq!(resolved, guard.root().join("notes"));
    }

    #[test]
    fn parent_escapes_fail_with_traversal() {
        let (_tmp, guard) = guard();
        let err = guard.resolve("../outside").unwrap_err();
        assert!(matches!(err, ToolError::PathTraversal));
        let err = guard.resolve("docs/../../outside").unwrap_err();
        assert!(matches!(err, ToolError::PathTraversal));
    }

    #[test]
    fn absolute_paths_outside_root_fail() {
        let (_tmp, guard) = guard();
        let err = guard.resolve("/etc/passwd").unwrap_err();
        assert!(matches!(err, ToolError::PathTraversal));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escapes_fail_with_traversal() {
        let (tmp, guard) = guard();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), tmp.path().join("link")).unwrap();
        let err = guard.resolve("link/secret.txt").unwrap_err();
        assert!(matches!(err, ToolError::PathTraversal));
    }

    #[test]
    fn bare_root_forms_are_recognized() {
        assert!(PathGuard::is_bare_root("."));
        assert!(PathGuard::is_bare_root("~"));
        assert!(PathGuard::is_bare_root("~/"));
        assert!(PathGuard::is_bare_root("  "));
        assert!(!PathGuard::is_bare_root("Documents"));
    }

    #[test]
    fn delete_verbs_require_confirmation() {
        assert_eq!(
            classify_command("rm -rf code/tmp"),
            CommandVerdict::ConfirmationRequired
        );
        assert_eq!(classify_command("rm notes.txt"), CommandVerdict::ConfirmationRequired);
    }

    #[test]
    fn root_destroying_flag_is_blocked() {
        assert!(matches!(
            classify_command("rm -rf / --no-preserve-root"),
            CommandVerdict::Blocked(_)
        ));
    }

    #[test]
    fn write_verbs_are_blocked() {
        assert!(matches!(classify_command("mkdir build"), CommandVerdict::Blocked(_)));
        assert!(matches!(
            classify_command("echo hi > out.txt"),
            CommandVerdict::Blocked(_)
        ));
    }

    #[test]
    fn plain_commands_are_approved() {
        assert_eq!(classify_command("ls -la"), CommandVerdict::Approved);
        assert_eq!(classify_command("python3 script.py"), CommandVerdict::Approved);
        // "format" contains no delete verb; word boundaries matter.
        assert_eq!(classify_command("cargo format"), CommandVerdict::Approved);
    }
}
