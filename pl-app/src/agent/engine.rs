//! Plan/approve/execute agent engine.
//!
//! One turn is: classify the prompt, either answer conversationally or
//! propose a tool plan, then execute approved plans one step at a time.
//! Steps that need user input (destructive commands, oversized directory
//! reads) park the plan with a pending action until the user resolves it.
//!
//! All mutation of a chat goes through that chat's async lock, so two
//! concurrent requests for the same chat serialize instead of interleaving
//! transcript writes.

use crate::agent::plan::{parse_plan, plan_to_pretty_json, PlanStep};
use crate::agent::prompts;
use crate::render;
use crate::store::{ChatStore, MessageKind};
use anyhow::{anyhow, bail, Result};
use dashmap::DashMap;
use pl_llm::{ChatMessage, Generation, GenerationBackend, LlmError, Role};
use pl_tools::{FileTokenCost, RunCommandTool, ToolContext, ToolOutcome, ToolRegistry};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

const PLACEHOLDER_TITLE: &str = "New Chat";
const PLAN_DONE_MESSAGE: &str = "Agent has completed the plan.";

#[derive(Debug, Clone)]
pub enum PendingAction {
    ConfirmCommand {
        command: String,
    },
    SelectFiles {
        path: String,
        files: Vec<FileTokenCost>,
        total_tokens: u64,
    },
}

struct ActivePlan {
    steps: Vec<PlanStep>,
    cursor: usize,
    goal: String,
    /// No step runs until the user approves the proposed plan.
    approved: bool,
    pending: Option<PendingAction>,
}

/// What one prompt turn produced, for the HTTP layer to return.
#[derive(Debug)]
pub struct TurnReply {
    pub content: String,
    pub kind: MessageKind,
    /// Present when a plan was proposed: the editable JSON document.
    pub raw_plan: Option<String>,
}

/// Result of driving the plan one step forward.
#[derive(Debug)]
pub enum StepOutcome {
    /// Step finished; more steps remain.
    Proceed,
    PausedForConfirmation {
        command: String,
    },
    PausedForFileSelection {
        files: Vec<FileTokenCost>,
        total_tokens: u64,
    },
    /// Plan finished (or there was nothing left to run).
    Completed {
        message: String,
    },
    /// Step failed or was denied; the plan stays where it was.
    Failed {
        message: String,
    },
}

pub struct AgentEngine {
    llm: Arc<dyn GenerationBackend>,
    store: Arc<ChatStore>,
    registry: Arc<ToolRegistry>,
    command_runner: Arc<RunCommandTool>,
    title_model: String,
    plans: DashMap<Uuid, ActivePlan>,
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl AgentEngine {
    pub fn new(
        llm: Arc<dyn GenerationBackend>,
        store: Arc<ChatStore>,
        registry: Arc<ToolRegistry>,
        command_runner: Arc<RunCommandTool>,
        title_model: String,
    ) -> Self {
        Self {
            llm,
            store,
            registry,
            command_runner,
            title_model,
            plans: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn chat_lock(&self, chat_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(chat_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Editable JSON of the chat's current plan, if one is active.
    pub fn plan_document(&self, chat_id: Uuid) -> Option<String> {
        self.plans
            .get(&chat_id)
            .map(|p| plan_to_pretty_json(&p.steps))
    }

    pub fn has_active_plan(&self, chat_id: Uuid) -> bool {
        self.plans.contains_key(&chat_id)
    }

    /// Handle one user prompt end to end: record it, classify it, and
    /// either reply conversationally or propose a plan for approval.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id, agent_mode))]
    pub async fn handle_prompt(
        &self,
        chat_id: Uuid,
        prompt: &str,
        agent_mode: bool,
    ) -> Result<TurnReply> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let chat = self
            .store
            .get_chat(chat_id)?
            .ok_or_else(|| anyhow!("unknown chat {chat_id}"))?;
        let history = self.plain_history(chat_id)?;

        self.store.append_message(
            chat_id,
            Role::User,
            &render::escape_html(prompt),
            prompt,
            MessageKind::Chat,
        )?;

        if chat.title == PLACEHOLDER_TITLE {
            self.autogenerate_title(chat_id, prompt).await;
        }

        if agent_mode && self.classify_as_task(&chat.model, prompt).await {
            match self.propose_plan(chat_id, &chat.model, &history, prompt).await? {
                Some(reply) => return Ok(reply),
                // Invalid plan already recorded; answer as chat instead.
                None => {}
            }
        }

        self.chat_reply(chat_id, &chat.model, &history, prompt).await
    }

    async fn classify_as_task(&self, model: &str, prompt: &str) -> bool {
        let question = prompts::classifier_prompt(prompt);
        match self.llm.generate(model, &[], &question).await {
            Ok(Generation::Text(label)) => label.to_uppercase().contains("TASK"),
            // Anything ambiguous degrades to a plain chat turn.
            Ok(Generation::Blocked { .. }) | Err(_) => false,
        }
    }

    /// Ask the planner for a step list. `Ok(Some(..))` is a proposed plan,
    /// `Ok(None)` means the caller should fall back to a chat reply.
    async fn propose_plan(
        &self,
        chat_id: Uuid,
        model: &str,
        history: &[ChatMessage],
        goal: &str,
    ) -> Result<Option<TurnReply>> {
        let manifest = serde_json::to_string_pretty(&self.registry.manifest())
            .unwrap_or_else(|_| self.registry.manifest().to_string());
        let question = prompts::planner_prompt(goal, &manifest);

        let raw = match self.llm.generate(model, history, &question).await {
            Ok(Generation::Text(raw)) => raw,
            Ok(Generation::Blocked { .. }) => {
                let msg = "--- ERROR: The agent plan was blocked by safety filters. ---";
                self.record_model_notice(chat_id, msg)?;
                return Ok(Some(TurnReply {
                    content: render::escape_html(msg),
                    kind: MessageKind::Chat,
                    raw_plan: None,
                }));
            }
            Err(e) => {
                let msg = llm_failure_message(&e);
                self.record_model_notice(chat_id, &msg)?;
                return Ok(Some(TurnReply {
                    content: render::escape_html(&msg),
                    kind: MessageKind::Chat,
                    raw_plan: None,
                }));
            }
        };

        match parse_plan(&raw) {
            Ok(steps) => {
                self.plans.insert(
                    chat_id,
                    ActivePlan {
                        steps: steps.clone(),
                        cursor: 0,
                        goal: goal.to_string(),
                        approved: false,
                        pending: None,
                    },
                );
                let raw_plan = plan_to_pretty_json(&steps);
                let content = render::plan_html(&steps);
                self.store.append_message(
                    chat_id,
                    Role::Model,
                    &content,
                    &raw_plan,
                    MessageKind::AgentPlan,
                )?;
                tracing::info!(steps = steps.len(), "plan proposed");
                Ok(Some(TurnReply {
                    content,
                    kind: MessageKind::AgentPlan,
                    raw_plan: Some(raw_plan),
                }))
            }
            Err(e) => {
                // Record both the parse error and the raw model text, then
                // let the turn degrade to a conversational answer.
                let msg = format!(
                    "--- ERROR: Model generated an invalid plan. Trying as chat instead. ---\n{e}\n\n{raw}"
                );
                self.record_model_notice(chat_id, &msg)?;
                tracing::warn!(error = %e, "plan parse failed; falling back to chat");
                Ok(None)
            }
        }
    }

    async fn chat_reply(
        &self,
        chat_id: Uuid,
        model: &str,
        history: &[ChatMessage],
        prompt: &str,
    ) -> Result<TurnReply> {
        let (content, raw) = match self.llm.generate(model, history, prompt).await {
            Ok(Generation::Text(text)) => (render::chat_reply_html(&text, model), text),
            Ok(Generation::Blocked { reason }) => {
                let msg =
                    format!("--- ERROR: The response was blocked by safety filters. ({reason}) ---");
                (render::escape_html(&msg), msg)
            }
            Err(e) => {
                let msg = llm_failure_message(&e);
                (render::escape_html(&msg), msg)
            }
        };
        self.store
            .append_message(chat_id, Role::Model, &content, &raw, MessageKind::Chat)?;
        Ok(TurnReply {
            content,
            kind: MessageKind::Chat,
            raw_plan: None,
        })
    }

    async fn autogenerate_title(&self, chat_id: Uuid, prompt: &str) {
        let question = prompts::title_prompt(prompt);
        let generated = self
            .llm
            .generate(&self.title_model, &[], &question)
            .await;
        // Title generation is cosmetic; failures keep the placeholder.
        if let Ok(Generation::Text(text)) = generated {
            let title = clean_title(&text);
            if !title.is_empty() {
                if let Err(e) = self.store.set_title(chat_id, &title) {
                    tracing::warn!(error = %e, "failed to store generated title");
                }
            }
        }
    }

    /// Replace the active plan with a user-edited (or re-approved) one.
    /// The document goes through the same parser as model output.
    pub async fn approve_plan(&self, chat_id: Uuid, plan_json: &str) -> Result<()> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let steps = parse_plan(plan_json).map_err(|e| anyhow!("invalid plan document: {e}"))?;
        if steps.is_empty() {
            bail!("plan has no steps");
        }
        let goal = match self.plans.get(&chat_id).map(|p| p.goal.clone()) {
            Some(goal) if !goal.is_empty() => goal,
            // A plan submitted without a prior proposal still needs a goal
            // for the synthesis step; the latest user message is the goal.
            _ => self.last_user_prompt(chat_id)?,
        };

        let pretty = plan_to_pretty_json(&steps);
        self.store.append_message(
            chat_id,
            Role::User,
            &format!(
                "User edited and approved plan:\n{}",
                render::json_block_html(&serde_json::json!({ "plan": steps }))
            ),
            &format!("User edited and approved plan:\n{pretty}"),
            MessageKind::UserConfirmation,
        )?;

        self.plans.insert(
            chat_id,
            ActivePlan {
                steps,
                cursor: 0,
                goal,
                approved: true,
                pending: None,
            },
        );
        Ok(())
    }

    /// Run the next step of the active plan.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id))]
    pub async fn execute_step(&self, chat_id: Uuid) -> Result<StepOutcome> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        // Snapshot the current step and release the map entry before any
        // await point.
        enum Next {
            Idle,
            Done,
            Unapproved,
            Pending(PendingAction),
            Step(PlanStep),
        }
        let next = match self.plans.get(&chat_id) {
            None => Next::Idle,
            Some(plan) => {
                if !plan.approved {
                    Next::Unapproved
                } else if let Some(pending) = &plan.pending {
                    Next::Pending(pending.clone())
                } else if plan.cursor >= plan.steps.len() {
                    Next::Done
                } else {
                    Next::Step(plan.steps[plan.cursor].clone())
                }
            }
        };

        let step = match next {
            // No plan was ever proposed: nothing to do, nothing recorded.
            Next::Idle => {
                return Ok(StepOutcome::Failed {
                    message: "No active plan for this chat.".to_string(),
                });
            }
            Next::Done => {
                self.plans.remove(&chat_id);
                self.record_model_notice(chat_id, PLAN_DONE_MESSAGE)?;
                return Ok(StepOutcome::Completed {
                    message: PLAN_DONE_MESSAGE.to_string(),
                });
            }
            Next::Unapproved => {
                return Ok(StepOutcome::Failed {
                    message: "The plan has not been approved yet.".to_string(),
                });
            }
            Next::Pending(PendingAction::ConfirmCommand { command }) => {
                return Ok(StepOutcome::PausedForConfirmation { command });
            }
            Next::Pending(PendingAction::SelectFiles {
                files,
                total_tokens,
                ..
            }) => {
                return Ok(StepOutcome::PausedForFileSelection {
                    files,
                    total_tokens,
                });
            }
            Next::Step(step) => step,
        };

        let Some(_tool) = self.registry.get(&step.tool) else {
            let msg = format!("Error: Tool \"{}\" not found.", step.tool);
            self.record_model_notice(chat_id, &msg)?;
            return Ok(StepOutcome::Failed { message: msg });
        };

        // The call itself is recorded before dispatch so an aborted step
        // still leaves a trace.
        let call_doc = serde_json::json!({
            "tool": step.tool,
            "parameters": step.parameters,
        });
        self.store.append_message(
            chat_id,
            Role::Model,
            &format!(
                "Calling <strong>{}</strong>\n{}",
                render::escape_html(&step.tool),
                render::json_block_html(&call_doc)
            ),
            &call_doc.to_string(),
            MessageKind::ToolCall,
        )?;

        let ctx = ToolContext { chat_id };
        let args = serde_json::Value::Object(step.parameters.clone());
        let outcome = match self.registry.dispatch(&step.tool, &ctx, args).await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::Error {
                message: e.into_message(),
            },
        };

        self.handle_step_outcome(chat_id, &step, outcome).await
    }

    async fn handle_step_outcome(
        &self,
        chat_id: Uuid,
        step: &PlanStep,
        outcome: ToolOutcome,
    ) -> Result<StepOutcome> {
        match outcome {
            ToolOutcome::ConfirmationPending { command } => {
                self.store.append_message(
                    chat_id,
                    Role::Model,
                    &format!(
                        "The agent wants to run a destructive command and needs your \
                         approval:\n<pre>{}</pre>",
                        render::escape_html(&command)
                    ),
                    &format!("Confirmation requested for command: {command}"),
                    MessageKind::UserConfirmation,
                )?;
                if let Some(mut plan) = self.plans.get_mut(&chat_id) {
                    plan.pending = Some(PendingAction::ConfirmCommand {
                        command: command.clone(),
                    });
                }
                Ok(StepOutcome::PausedForConfirmation { command })
            }
            ToolOutcome::FileSelectionPending {
                files,
                total_tokens,
            } => {
                let path = step
                    .parameters
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or(".")
                    .to_string();
                let listing = serde_json::json!({
                    "files": files,
                    "total_tokens": total_tokens,
                });
                self.store.append_message(
                    chat_id,
                    Role::Model,
                    &format!(
                        "The directory is too large to read whole. Select which files to \
                         include:\n{}",
                        render::json_block_html(&listing)
                    ),
                    &format!("File selection requested:\n{listing}"),
                    MessageKind::UserConfirmation,
                )?;
                if let Some(mut plan) = self.plans.get_mut(&chat_id) {
                    plan.pending = Some(PendingAction::SelectFiles {
                        path,
                        files: files.clone(),
                        total_tokens,
                    });
                }
                Ok(StepOutcome::PausedForFileSelection {
                    files,
                    total_tokens,
                })
            }
            ToolOutcome::Success { .. } | ToolOutcome::Error { .. } => {
                self.advance_after_output(chat_id, outcome).await
            }
        }
    }

    /// Record a step's terminal output, advance the cursor, and finish the
    /// plan with a synthesized answer once the last step has run.
    async fn advance_after_output(
        &self,
        chat_id: Uuid,
        outcome: ToolOutcome,
    ) -> Result<StepOutcome> {
        let doc = serde_json::to_value(&outcome)?;
        self.store.append_message(
            chat_id,
            Role::Model,
            &render::json_block_html(&doc),
            &doc.to_string(),
            MessageKind::ToolOutput,
        )?;

        let (finished, goal) = {
            let Some(mut plan) = self.plans.get_mut(&chat_id) else {
                return Ok(StepOutcome::Completed {
                    message: PLAN_DONE_MESSAGE.to_string(),
                });
            };
            plan.cursor += 1;
            (plan.cursor >= plan.steps.len(), plan.goal.clone())
        };
        if !finished {
            return Ok(StepOutcome::Proceed);
        }

        let chat = self
            .store
            .get_chat(chat_id)?
            .ok_or_else(|| anyhow!("unknown chat {chat_id}"))?;
        let history = self.plain_history(chat_id)?;
        let question = prompts::synthesis_prompt(&goal);

        let message = match self.llm.generate(&chat.model, &history, &question).await {
            Ok(Generation::Text(text)) => {
                self.store.append_message(
                    chat_id,
                    Role::Model,
                    &render::chat_reply_html(&text, &chat.model),
                    &text,
                    MessageKind::Chat,
                )?;
                text
            }
            Ok(Generation::Blocked { reason }) => {
                let msg = format!(
                    "--- ERROR: The final answer was blocked by safety filters. ({reason}) ---"
                );
                self.record_model_notice(chat_id, &msg)?;
                msg
            }
            Err(e) => {
                let msg = format!("An error occurred during agent execution: {e}");
                self.record_model_notice(chat_id, &msg)?;
                // The plan stays consumed-but-present; the next execution
                // request resolves it through the completion path.
                return Ok(StepOutcome::Failed { message: msg });
            }
        };
        self.plans.remove(&chat_id);
        Ok(StepOutcome::Completed { message })
    }

    /// Resolve a pending destructive-command confirmation.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id, approved))]
    pub async fn resolve_confirmation(
        &self,
        chat_id: Uuid,
        approved: bool,
    ) -> Result<StepOutcome> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let command = {
            let Some(mut plan) = self.plans.get_mut(&chat_id) else {
                bail!("no active plan for chat {chat_id}");
            };
            let Some(PendingAction::ConfirmCommand { command }) = plan.pending.clone() else {
                bail!("no command awaiting confirmation");
            };
            plan.pending = None;
            command
        };

        let decision = if approved {
            format!("User approved the command: {command}")
        } else {
            format!("User denied the command: {command}")
        };
        self.store.append_message(
            chat_id,
            Role::User,
            &render::escape_html(&decision),
            &decision,
            MessageKind::UserConfirmation,
        )?;

        if !approved {
            let msg = "Command denied by user. The step was not executed.".to_string();
            return Ok(StepOutcome::Failed { message: msg });
        }

        let outcome = match self.command_runner.run_confirmed(&command).await {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::Error {
                message: e.into_message(),
            },
        };
        self.advance_after_output(chat_id, outcome).await
    }

    /// Resolve a pending file selection by re-running the directory read
    /// restricted to the chosen files.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %chat_id))]
    pub async fn resolve_selection(
        &self,
        chat_id: Uuid,
        files: Vec<String>,
    ) -> Result<StepOutcome> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        let path = {
            let Some(mut plan) = self.plans.get_mut(&chat_id) else {
                bail!("no active plan for chat {chat_id}");
            };
            let Some(PendingAction::SelectFiles { path, .. }) = plan.pending.clone() else {
                bail!("no file selection pending");
            };
            plan.pending = None;
            path
        };

        let decision = format!("User selected {} file(s): {}", files.len(), files.join(", "));
        self.store.append_message(
            chat_id,
            Role::User,
            &render::escape_html(&decision),
            &decision,
            MessageKind::UserConfirmation,
        )?;

        let ctx = ToolContext { chat_id };
        let args = serde_json::json!({
            "path": path,
            "selected_files": files,
        });
        let outcome = match self
            .registry
            .dispatch("read_directory_recursive", &ctx, args)
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => ToolOutcome::Error {
                message: e.into_message(),
            },
        };
        self.advance_after_output(chat_id, outcome).await
    }

    /// Drop the active plan, if any. Returns whether one existed.
    pub async fn cancel_plan(&self, chat_id: Uuid) -> Result<bool> {
        let lock = self.chat_lock(chat_id);
        let _guard = lock.lock().await;

        if self.plans.remove(&chat_id).is_none() {
            return Ok(false);
        }
        self.record_model_notice(chat_id, "Agent plan cancelled.")?;
        Ok(true)
    }

    /// Conversation history as the model sees it: chat text and tool
    /// traffic, never rendered HTML and never approval bookkeeping.
    fn plain_history(&self, chat_id: Uuid) -> Result<Vec<ChatMessage>> {
        let messages = self.store.messages_for_chat(chat_id)?;
        Ok(messages
            .into_iter()
            .filter(|m| {
                matches!(
                    m.kind,
                    MessageKind::Chat | MessageKind::ToolCall | MessageKind::ToolOutput
                )
            })
            .map(|m| ChatMessage::new(m.role, m.raw_content))
            .collect())
    }

    fn last_user_prompt(&self, chat_id: Uuid) -> Result<String> {
        let messages = self.store.messages_for_chat(chat_id)?;
        Ok(messages
            .into_iter()
            .rev()
            .find(|m| m.role == Role::User && m.kind == MessageKind::Chat)
            .map(|m| m.raw_content)
            .unwrap_or_default())
    }

    fn record_model_notice(&self, chat_id: Uuid, message: &str) -> Result<()> {
        self.store.append_message(
            chat_id,
            Role::Model,
            &render::escape_html(message),
            message,
            MessageKind::Chat,
        )?;
        Ok(())
    }
}

fn llm_failure_message(e: &LlmError) -> String {
    match e {
        LlmError::RateLimited => {
            "--- ERROR: RATE LIMIT EXCEEDED ---\nWaiting for 60 seconds. Please resend your \
             message shortly."
                .to_string()
        }
        other => format!("An error occurred: {other}"),
    }
}

fn clean_title(raw: &str) -> String {
    let first_line = raw.trim().lines().next().unwrap_or("");
    first_line
        .trim()
        .trim_matches('"')
        .chars()
        .filter(|c| !matches!(c, '*' | '_' | '#' | '~'))
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pl_tools::{
        FileCache, ListDirectoryTool, PathGuard, ReadDirectoryTool, ReadFileTool, SandboxLimits,
    };
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Backend that replays a fixed script of generation results and keeps
    /// every prompt it was asked.
    struct ScriptedBackend {
        script: std::sync::Mutex<VecDeque<pl_llm::Result<Generation>>>,
        prompts: std::sync::Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(script: Vec<pl_llm::Result<Generation>>) -> Self {
            Self {
                script: std::sync::Mutex::new(script.into()),
                prompts: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        async fn generate(
            &self,
            _model: &str,
            _history: &[ChatMessage],
            prompt: &str,
        ) -> pl_llm::Result<Generation> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("scripted backend exhausted"))
        }
    }

    fn text(s: &str) -> pl_llm::Result<Generation> {
        Ok(Generation::Text(s.to_string()))
    }

    fn blocked(reason: &str) -> pl_llm::Result<Generation> {
        Ok(Generation::Blocked {
            reason: reason.to_string(),
        })
    }

    struct Harness {
        engine: AgentEngine,
        store: Arc<ChatStore>,
        backend: Arc<ScriptedBackend>,
        sandbox: tempfile::TempDir,
        chat_id: Uuid,
    }

    impl Harness {
        fn new(script: Vec<pl_llm::Result<Generation>>) -> Self {
            Self::with_limits(script, SandboxLimits::default())
        }

        fn with_limits(
            script: Vec<pl_llm::Result<Generation>>,
            limits: SandboxLimits,
        ) -> Self {
            let sandbox = tempfile::tempdir().unwrap();
            let workspace = sandbox.path().join("code");
            std::fs::create_dir_all(&workspace).unwrap();

            let guard = Arc::new(PathGuard::new(sandbox.path()).unwrap());
            let cache = Arc::new(FileCache::new(Duration::from_secs(3600)));
            let runner = Arc::new(RunCommandTool::new(&workspace, Duration::from_secs(30)));

            let mut registry = ToolRegistry::new();
            registry.register(Arc::new(ListDirectoryTool::new(guard.clone())));
            registry.register(Arc::new(ReadFileTool::new(
                guard.clone(),
                limits.clone(),
                cache.clone(),
            )));
            registry.register(Arc::new(ReadDirectoryTool::new(guard, limits, cache)));
            registry.register(runner.clone() as Arc<dyn pl_tools::Tool>);

            let store = Arc::new(ChatStore::open_in_memory().unwrap());
            let chat_id = Uuid::new_v4();
            store
                .create_chat(chat_id, "testing", "gemini-2.5-flash")
                .unwrap();

            let backend = Arc::new(ScriptedBackend::new(script));
            let engine = AgentEngine::new(
                backend.clone(),
                store.clone(),
                Arc::new(registry),
                runner,
                "gemini-2.5-flash-lite".to_string(),
            );
            Self {
                engine,
                store,
                backend,
                sandbox,
                chat_id,
            }
        }

        fn kinds(&self) -> Vec<MessageKind> {
            self.store
                .messages_for_chat(self.chat_id)
                .unwrap()
                .iter()
                .map(|m| m.kind)
                .collect()
        }
    }

    fn one_step_plan(tool: &str, params: serde_json::Value) -> String {
        serde_json::json!({
            "plan": [{ "step": 1, "tool": tool, "parameters": params, "reasoning": "r" }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn chat_turn_renders_markdown_reply() {
        let h = Harness::new(vec![text("**bold** answer")]);
        let reply = h
            .engine
            .handle_prompt(h.chat_id, "hello", false)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Chat);
        assert!(reply.content.contains("<strong>bold</strong>"));
        assert!(reply.content.contains("(Model: gemini-2.5-flash)"));
        assert_eq!(h.kinds(), vec![MessageKind::Chat, MessageKind::Chat]);
    }

    #[tokio::test]
    async fn task_prompt_proposes_then_completes_a_plan() {
        let h = Harness::new(vec![
            text("TASK"),
            text(&one_step_plan("list_directory", serde_json::json!({ "path": "." }))),
            text("Everything is listed."),
        ]);
        std::fs::write(h.sandbox.path().join("a.txt"), "x").unwrap();

        let reply = h
            .engine
            .handle_prompt(h.chat_id, "list the sandbox", true)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::AgentPlan);
        assert!(reply.content.contains("list_directory"));
        let raw_plan = reply.raw_plan.unwrap();

        // Nothing runs before approval.
        let gated = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(gated, StepOutcome::Failed { ref message } if message.contains("approved")));

        h.engine.approve_plan(h.chat_id, &raw_plan).await.unwrap();
        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        match outcome {
            StepOutcome::Completed { message } => assert!(message.contains("listed")),
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!h.engine.has_active_plan(h.chat_id));
        assert_eq!(
            h.kinds(),
            vec![
                MessageKind::Chat,
                MessageKind::AgentPlan,
                MessageKind::UserConfirmation,
                MessageKind::ToolCall,
                MessageKind::ToolOutput,
                MessageKind::Chat,
            ]
        );
    }

    #[tokio::test]
    async fn multi_step_plan_advances_one_step_per_call() {
        let h = Harness::new(vec![text("Done.")]);
        let plan = serde_json::json!({
            "plan": [
                { "step": 1, "tool": "list_directory", "parameters": { "path": "code" }, "reasoning": "r" },
                { "step": 2, "tool": "list_directory", "parameters": { "path": "code" }, "reasoning": "r" }
            ]
        })
        .to_string();
        h.engine.approve_plan(h.chat_id, &plan).await.unwrap();

        let first = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(first, StepOutcome::Proceed));
        let second = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(second, StepOutcome::Completed { .. }));

        let calls = h
            .kinds()
            .into_iter()
            .filter(|k| *k == MessageKind::ToolCall)
            .count();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn destructive_command_pauses_then_deny_then_approve() {
        let h = Harness::new(vec![text("Removed it.")]);
        let victim = h.sandbox.path().join("code").join("victim.txt");
        std::fs::write(&victim, "data").unwrap();

        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan("run_command", serde_json::json!({ "command": "rm victim.txt" })),
            )
            .await
            .unwrap();

        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::PausedForConfirmation { ref command } if command == "rm victim.txt"));
        assert!(victim.exists());

        let denied = h.engine.resolve_confirmation(h.chat_id, false).await.unwrap();
        assert!(matches!(denied, StepOutcome::Failed { .. }));
        assert!(victim.exists());
        assert!(h.engine.has_active_plan(h.chat_id));

        // Re-executing re-requests confirmation for the same step.
        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::PausedForConfirmation { .. }));

        let approved = h.engine.resolve_confirmation(h.chat_id, true).await.unwrap();
        assert!(matches!(approved, StepOutcome::Completed { .. }));
        assert!(!victim.exists());
    }

    #[tokio::test]
    async fn invalid_plan_falls_back_to_chat_and_records_raw_text() {
        let h = Harness::new(vec![
            text("TASK"),
            text("here is my plan: first we look around"),
            text("plain answer"),
        ]);
        let reply = h
            .engine
            .handle_prompt(h.chat_id, "do something", true)
            .await
            .unwrap();
        assert_eq!(reply.kind, MessageKind::Chat);
        assert!(reply.content.contains("plain answer"));
        assert!(!h.engine.has_active_plan(h.chat_id));

        let messages = h.store.messages_for_chat(h.chat_id).unwrap();
        let notice = messages
            .iter()
            .find(|m| m.raw_content.contains("invalid plan"))
            .unwrap();
        assert!(notice.raw_content.contains("first we look around"));
    }

    #[tokio::test]
    async fn unknown_tool_fails_the_step_but_keeps_the_plan() {
        let h = Harness::new(vec![]);
        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan("frobnicate", serde_json::json!({})),
            )
            .await
            .unwrap();

        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        match outcome {
            StepOutcome::Failed { message } => {
                assert!(message.contains("\"frobnicate\" not found"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(h.engine.has_active_plan(h.chat_id));
    }

    #[tokio::test]
    async fn rate_limited_planner_reports_fixed_wait() {
        let h = Harness::new(vec![text("TASK"), Err(LlmError::RateLimited)]);
        let reply = h
            .engine
            .handle_prompt(h.chat_id, "do a task", true)
            .await
            .unwrap();
        assert!(reply.content.contains("RATE LIMIT EXCEEDED"));
        assert!(reply.content.contains("60 seconds"));
    }

    #[tokio::test]
    async fn oversized_directory_pauses_for_selection_then_resumes() {
        let limits = SandboxLimits {
            context_window_threshold: 10,
            max_files_before_selection: 64,
        };
        let h = Harness::with_limits(vec![text("Summarized the chosen file.")], limits);
        let docs = h.sandbox.path().join("docs");
        std::fs::create_dir(&docs).unwrap();
        // 6 tokens each: under the per-file limit, over it in aggregate.
        std::fs::write(docs.join("a.txt"), "a".repeat(24)).unwrap();
        std::fs::write(docs.join("b.txt"), "b".repeat(24)).unwrap();

        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan(
                    "read_directory_recursive",
                    serde_json::json!({ "path": "docs" }),
                ),
            )
            .await
            .unwrap();

        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        let files = match outcome {
            StepOutcome::PausedForFileSelection { files, .. } => files,
            other => panic!("expected selection pause, got {other:?}"),
        };
        assert_eq!(files.len(), 2);

        let chosen = files[0].path.clone();
        let resumed = h
            .engine
            .resolve_selection(h.chat_id, vec![chosen])
            .await
            .unwrap();
        assert!(matches!(resumed, StepOutcome::Completed { .. }));
        assert!(!h.engine.has_active_plan(h.chat_id));
    }

    #[tokio::test]
    async fn placeholder_title_is_autogenerated() {
        let h = Harness::new(vec![text("\"Sandbox File Tour\""), text("sure")]);
        let chat_id = Uuid::new_v4();
        h.store.create_chat(chat_id, "New Chat", "gemini-2.5-flash").unwrap();

        h.engine
            .handle_prompt(chat_id, "show me around the sandbox", false)
            .await
            .unwrap();
        let chat = h.store.get_chat(chat_id).unwrap().unwrap();
        assert_eq!(chat.title, "Sandbox File Tour");
    }

    #[tokio::test]
    async fn executing_without_a_plan_fails_and_records_nothing() {
        let h = Harness::new(vec![]);
        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(
            matches!(outcome, StepOutcome::Failed { ref message } if message.contains("No active plan"))
        );
        assert!(h.kinds().is_empty());
    }

    #[tokio::test]
    async fn blocked_synthesis_is_reported_as_a_safety_error() {
        let h = Harness::new(vec![blocked("SAFETY")]);
        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan("list_directory", serde_json::json!({ "path": "." })),
            )
            .await
            .unwrap();

        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        match outcome {
            StepOutcome::Completed { message } => {
                assert!(message.contains("blocked by safety filters"));
                assert!(message.contains("SAFETY"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert!(!h.engine.has_active_plan(h.chat_id));

        let last = h.store.messages_for_chat(h.chat_id).unwrap().pop().unwrap();
        assert!(last.raw_content.contains("blocked by safety filters"));
        assert_ne!(last.raw_content, PLAN_DONE_MESSAGE);
    }

    #[tokio::test]
    async fn direct_approval_takes_goal_from_last_user_message() {
        let h = Harness::new(vec![text("One file lives here.")]);
        h.store
            .append_message(
                h.chat_id,
                Role::User,
                "how many files are in the sandbox?",
                "how many files are in the sandbox?",
                MessageKind::Chat,
            )
            .unwrap();

        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan("list_directory", serde_json::json!({ "path": "." })),
            )
            .await
            .unwrap();
        let outcome = h.engine.execute_step(h.chat_id).await.unwrap();
        assert!(matches!(outcome, StepOutcome::Completed { .. }));

        // The synthesis prompt carries the user's question as the goal.
        assert!(h
            .backend
            .last_prompt()
            .contains("how many files are in the sandbox?"));
    }

    #[tokio::test]
    async fn cancel_drops_the_plan() {
        let h = Harness::new(vec![]);
        h.engine
            .approve_plan(
                h.chat_id,
                &one_step_plan("list_directory", serde_json::json!({ "path": "." })),
            )
            .await
            .unwrap();
        assert!(h.engine.cancel_plan(h.chat_id).await.unwrap());
        assert!(!h.engine.has_active_plan(h.chat_id));
        assert!(!h.engine.cancel_plan(h.chat_id).await.unwrap());
    }
}
