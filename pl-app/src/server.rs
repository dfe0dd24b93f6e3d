//! Planloom server assembly.
//!
//! Wires config, storage, the sandboxed tool registry and the agent engine
//! into one axum application.

use crate::agent::AgentEngine;
use crate::config::AppConfig;
use crate::routes;
use crate::store::ChatStore;
use anyhow::{Context, Result};
use axum::http::Request;
use axum::response::Response;
use axum::Extension;
use pl_llm::GeminiClient;
use pl_tools::{
    AppendFileTool, DeleteFileTool, EditExistingFileTool, FileCache, ListDirectoryTool, PathGuard,
    ReadDirectoryTool, ReadFileTool, RunCommandTool, RunScriptTool, SandboxLimits, SaveFileTool,
    Tool, ToolRegistry,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<ChatStore>,
    pub engine: Arc<AgentEngine>,
}

/// Validate config and credentials without starting the server.
pub async fn doctor(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path.as_deref())?;
    let _ = cfg.api_key()?;
    tracing::info!(
        models = ?cfg.general.models,
        title_model = %cfg.general.title_model,
        database = %cfg.storage.database.display(),
        sandbox_root = %cfg.sandbox.root.display(),
        bind = %format!("{}:{}", cfg.server.host, cfg.server.port),
        "config ok"
    );
    Ok(())
}

/// Create the database schema and sandbox directories, then exit.
pub async fn init(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path.as_deref())?;
    ensure_sandbox_dirs(&cfg)?;
    let _store = ChatStore::open(&cfg.storage.database)?;
    tracing::info!(
        database = %cfg.storage.database.display(),
        sandbox_root = %cfg.sandbox.root.display(),
        "initialized"
    );
    Ok(())
}

pub async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    let cfg = AppConfig::load(config_path.as_deref())?;
    let api_key = cfg.api_key()?;
    ensure_sandbox_dirs(&cfg)?;

    let store = Arc::new(ChatStore::open(&cfg.storage.database)?);
    let (registry, command_runner) = build_registry(&cfg)?;
    let llm = Arc::new(GeminiClient::new(&api_key));
    let engine = Arc::new(AgentEngine::new(
        llm,
        store.clone(),
        Arc::new(registry),
        command_runner,
        cfg.general.title_model.clone(),
    ));

    let addr: SocketAddr = format!("{}:{}", cfg.server.host, cfg.server.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", cfg.server.host, cfg.server.port))?;
    let http_timeout = Duration::from_secs(cfg.server.http_timeout_seconds);

    let state = Arc::new(AppState {
        config: cfg,
        store,
        engine,
    });

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                uri = %request.uri(),
            )
        })
        .on_response(
            |response: &Response, latency: Duration, _span: &tracing::Span| {
                tracing::info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http request completed"
                );
            },
        );

    let app = routes::router()
        .layer(Extension(state))
        .layer(TimeoutLayer::new(http_timeout))
        .layer(trace_layer);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "planloom serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("http server shutdown completed");
    Ok(())
}

fn ensure_sandbox_dirs(cfg: &AppConfig) -> Result<()> {
    std::fs::create_dir_all(&cfg.sandbox.root)
        .with_context(|| format!("creating sandbox root {}", cfg.sandbox.root.display()))?;
    let workspace = workspace_path(cfg);
    std::fs::create_dir_all(&workspace)
        .with_context(|| format!("creating workspace {}", workspace.display()))?;
    Ok(())
}

fn workspace_path(cfg: &AppConfig) -> PathBuf {
    if cfg.sandbox.workspace_dir.is_absolute() {
        cfg.sandbox.workspace_dir.clone()
    } else {
        cfg.sandbox.root.join(&cfg.sandbox.workspace_dir)
    }
}

/// Build the full tool set. The command runner is also returned on its own
/// because confirmed destructive commands bypass the registry dispatch.
fn build_registry(cfg: &AppConfig) -> Result<(ToolRegistry, Arc<RunCommandTool>)> {
    let guard = Arc::new(PathGuard::new(Path::new(&cfg.sandbox.root))?);
    let limits = SandboxLimits {
        context_window_threshold: cfg.sandbox.context_window_threshold,
        max_files_before_selection: cfg.sandbox.max_files_before_selection,
    };
    let cache = Arc::new(FileCache::new(Duration::from_secs(
        cfg.sandbox.cache_ttl_seconds,
    )));
    let workspace = workspace_path(cfg);
    let timeout = Duration::from_secs(cfg.sandbox.command_timeout_seconds);
    let command_runner = Arc::new(RunCommandTool::new(&workspace, timeout));

    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(ListDirectoryTool::new(guard.clone())));
    registry.register(Arc::new(ReadFileTool::new(guard.clone(), limits, cache.clone())));
    registry.register(Arc::new(ReadDirectoryTool::new(guard, limits, cache)));
    registry.register(Arc::new(SaveFileTool::new(&workspace)));
    registry.register(Arc::new(EditExistingFileTool::new(&workspace)));
    registry.register(Arc::new(AppendFileTool::new(&workspace)));
    registry.register(Arc::new(DeleteFileTool::new(&workspace)));
    registry.register(command_runner.clone() as Arc<dyn Tool>);
    registry.register(Arc::new(RunScriptTool::new(&workspace, timeout)));
    Ok((registry, command_runner))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler; using ctrl-c only");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "failed to await ctrl-c signal");
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("received ctrl-c; beginning graceful shutdown");
            }
            _ = terminate.recv() => {
                tracing::warn!("received SIGTERM; beginning graceful shutdown");
            }
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to await ctrl-c signal");
        } else {
            tracing::warn!("received ctrl-c; beginning graceful shutdown");
        }
    }
}
