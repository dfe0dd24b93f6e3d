//! Planloom configuration loader.
//!
//! A TOML file with defaults for every section; the API key may come from
//! the environment instead of the file.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "planloom.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub keys: KeysConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    /// Models a chat may be pinned to at creation time.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    /// Cheap model used for auto-generating chat titles.
    #[serde(default = "default_title_model")]
    pub title_model: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
            title_model: default_title_model(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            http_timeout_seconds: default_http_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SandboxConfig {
    /// Root every read/list operation is confined to.
    #[serde(default = "default_sandbox_root")]
    pub root: PathBuf,
    /// Directory file writes, commands and scripts run in.
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default = "default_context_window_threshold")]
    pub context_window_threshold: u64,
    #[serde(default = "default_max_files_before_selection")]
    pub max_files_before_selection: usize,
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    #[serde(default = "default_cache_ttl_seconds")]
    pub cache_ttl_seconds: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            root: default_sandbox_root(),
            workspace_dir: default_workspace_dir(),
            context_window_threshold: default_context_window_threshold(),
            max_files_before_selection: default_max_files_before_selection(),
            command_timeout_seconds: default_command_timeout_seconds(),
            cache_ttl_seconds: default_cache_ttl_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub gemini_api_key: Option<String>,
}

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.5-pro".to_string(),
        "gemini-2.5-flash".to_string(),
        "gemini-2.5-flash-lite".to_string(),
    ]
}

fn default_title_model() -> String {
    "gemini-2.5-flash-lite".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8098
}

fn default_http_timeout_seconds() -> u64 {
    120
}

fn default_database() -> PathBuf {
    PathBuf::from("planloom.db")
}

fn default_sandbox_root() -> PathBuf {
    PathBuf::from("sandbox")
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from("code")
}

fn default_context_window_threshold() -> u64 {
    65_536
}

fn default_max_files_before_selection() -> usize {
    64
}

fn default_command_timeout_seconds() -> u64 {
    30
}

fn default_cache_ttl_seconds() -> u64 {
    3600
}

impl AppConfig {
    /// Load from `path` (or the default location). A missing file yields the
    /// defaults so a fresh checkout can start without any setup.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        if !path.exists() {
            tracing::info!(path = %path.display(), "config file absent; using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let cfg: Self =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.models.is_empty() {
            bail!("general.models must list at least one model");
        }
        Ok(())
    }

    /// Environment takes precedence over the config file.
    pub fn api_key(&self) -> Result<String> {
        if let Ok(key) = std::env::var("GEMINI_API_KEY") {
            if !key.trim().is_empty() {
                return Ok(key);
            }
        }
        if let Some(key) = &self.keys.gemini_api_key {
            if !key.trim().is_empty() {
                return Ok(key.clone());
            }
        }
        bail!("GEMINI_API_KEY is not set (environment or [keys] in planloom.toml)")
    }

    pub fn is_valid_model(&self, model: &str) -> bool {
        self.general.models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = AppConfig::load(Some(Path::new("/nonexistent/planloom.toml"))).unwrap();
        assert_eq!(cfg.sandbox.context_window_threshold, 65_536);
        assert_eq!(cfg.sandbox.max_files_before_selection, 64);
        assert_eq!(cfg.sandbox.command_timeout_seconds, 30);
        assert!(cfg.is_valid_model("gemini-2.5-pro"));
        assert!(!cfg.is_valid_model("gpt-4o"));
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("planloom.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9000

[sandbox]
root = "/srv/data"
"#,
        )
        .unwrap();
        let cfg = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.server.host, "127.0.0.1");
        assert_eq!(cfg.sandbox.root, PathBuf::from("/srv/data"));
        assert_eq!(cfg.sandbox.workspace_dir, PathBuf::from("code"));
    }
}
