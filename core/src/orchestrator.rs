//! The prompt orchestrator: turns one `session/prompt` call into a stream of
//! `session/update` notifications plus a terminal result.
//!
//! Session state is single-writer: a session accepts at most one prompt at a
//! time, and a concurrent prompt is rejected with `session_busy` rather than
//! queued. All mutation of a given session happens inside its prompt call or
//! the session-store save path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gateway_protocol::CancelParams;
use gateway_protocol::CancelResult;
use gateway_protocol::ContentBlock;
use gateway_protocol::Exchange;
use gateway_protocol::GithubOperation;
use gateway_protocol::LoadSessionParams;
use gateway_protocol::LoadSessionResult;
use gateway_protocol::NewSessionParams;
use gateway_protocol::NewSessionResult;
use gateway_protocol::PromptParams;
use gateway_protocol::PromptResult;
use gateway_protocol::Role;
use gateway_protocol::SessionInfo;
use gateway_protocol::SessionUpdateParams;
use gateway_protocol::SetModeParams;
use gateway_protocol::SetModeResult;
use gateway_protocol::StopReason;
use gateway_protocol::ToolCallUpdate;
use gateway_protocol::ToolResultStatus;
use gateway_protocol::ToolResultUpdate;
use gateway_protocol::UpdateStatus;
use gateway_protocol::Usage;
use gateway_protocol::WorkspaceInfo;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::adapters::RuntimeSelector;
use crate::classifier::ClassifiedError;
use crate::classifier::ErrorCode;
use crate::config::Config;
use crate::extract::extract_patches;
use crate::extract::propose_file_write;
use crate::github::GithubAutomation;
use crate::github::NoopGithubAutomation;
use crate::github::PullRequestSpec;
use crate::history::DEFAULT_REPLAY_WINDOW;
use crate::history::build_adapter_input;
use crate::inflight::InFlightRegistry;
use crate::models::AdapterContext;
use crate::models::AdapterEvent;
use crate::models::AdapterMessage;
use crate::models::AdapterResult;
use crate::prompt::ComposedPrompt;
use crate::prompt::ContextFile;
use crate::prompt::compose;
use crate::sandbox::SandboxLimits;
use crate::sandbox::ToolSandbox;
use crate::session::Session;
use crate::store::SessionStore;
use crate::workspace::PrepareOptions;
use crate::workspace::Workspace;
use crate::workspace::WorkspaceManager;

/// Everything the handlers need, constructed once at startup and threaded
/// through by reference. There is no process-wide mutable state beyond the
/// environment snapshot inside `config`.
pub struct Services {
    pub config: Arc<Config>,
    pub store: Arc<SessionStore>,
    pub workspaces: Arc<WorkspaceManager>,
    pub selector: Arc<RuntimeSelector>,
    pub inflight: Arc<InFlightRegistry>,
    pub github: Arc<dyn GithubAutomation>,
}

impl Services {
    pub fn from_config(config: Config) -> Self {
        let store = Arc::new(SessionStore::new(config.sessions_dir()));
        let workspaces = Arc::new(WorkspaceManager::new(&config));
        Self {
            config: Arc::new(config),
            store,
            workspaces,
            selector: Arc::new(RuntimeSelector::new_default()),
            inflight: Arc::new(InFlightRegistry::new()),
            github: Arc::new(NoopGithubAutomation),
        }
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("session {0} already has a prompt in flight")]
    SessionBusy(String),

    #[error("session {0} is closed and accepts no further prompts")]
    SessionClosed(String),

    #[error("{0}")]
    InvalidParams(String),

    #[error(transparent)]
    Classified(#[from] ClassifiedError),
}

/// Where `session/update` notifications go. The transport decides how (and
/// whether) to deliver them; sends are awaited so updates reach the wire in
/// causal order, strictly before the terminal response.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn send_update(&self, update: SessionUpdateParams);
}

/// Sink that drops updates. Used by synchronous HTTP wrappers which only
/// deliver the terminal result.
pub struct NullSink;

#[async_trait]
impl UpdateSink for NullSink {
    async fn send_update(&self, _update: SessionUpdateParams) {}
}

/// Sink that forwards into an mpsc channel.
pub struct ChannelSink(pub mpsc::Sender<SessionUpdateParams>);

#[async_trait]
impl UpdateSink for ChannelSink {
    async fn send_update(&self, update: SessionUpdateParams) {
        let _ = self.0.send(update).await;
    }
}

pub struct PromptOrchestrator {
    services: Arc<Services>,
    sessions: Mutex<HashMap<String, Session>>,
    workspaces: Mutex<HashMap<String, Workspace>>,
}

struct DriveOutcome {
    result: AdapterResult,
    tool_trace: Vec<String>,
    summary: Option<String>,
    github_operations: Option<Vec<GithubOperation>>,
}

impl PromptOrchestrator {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            services,
            sessions: Mutex::new(HashMap::new()),
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    // -----------------------------------------------------------------
    // session/new
    // -----------------------------------------------------------------

    pub async fn new_session(
        &self,
        params: NewSessionParams,
    ) -> Result<NewSessionResult, OrchestratorError> {
        let options = params.session_options.unwrap_or_default();
        let mut session = Session::new(params.mode, options, params.workspace_uri.clone());
        if let Some(summary) = params.initial_context.and_then(|c| c.context_summary) {
            session
                .agent_context
                .insert("contextSummary".to_string(), Value::String(summary));
        }

        let workspace = self.prepare_workspace(&session).await?;
        let workspace_info = workspace_info(&workspace);

        if session.options.persist_history {
            self.services
                .store
                .save(&session)
                .await
                .map_err(ClassifiedError::from)?;
        }
        info!(session_id = %session.id, root = %workspace.path.display(), "session created");

        let session_id = session.id.clone();
        self.workspaces
            .lock()
            .await
            .insert(session_id.clone(), workspace);
        self.sessions
            .lock()
            .await
            .insert(session_id.clone(), session);

        Ok(NewSessionResult {
            session_id,
            workspace_info,
        })
    }

    // -----------------------------------------------------------------
    // session/load
    // -----------------------------------------------------------------

    pub async fn load_session(
        &self,
        params: LoadSessionParams,
    ) -> Result<LoadSessionResult, OrchestratorError> {
        let session = self.fetch_session(&params.session_id).await?;
        let workspace = self.ensure_workspace(&session).await?;

        let history_available = !session.message_history.is_empty();
        Ok(LoadSessionResult {
            session_info: SessionInfo {
                session_id: session.id.clone(),
                state: session.state,
                created_at: session.created_at,
                last_active_at: session.last_active_at,
            },
            workspace_info: workspace_info(&workspace),
            history_available,
            history: history_available.then(|| session.message_history.clone()),
        })
    }

    pub async fn set_mode(
        &self,
        params: SetModeParams,
    ) -> Result<SetModeResult, OrchestratorError> {
        let snapshot = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(&params.session_id)
                .ok_or_else(|| OrchestratorError::SessionNotFound(params.session_id.clone()))?;
            session.mode = params.mode;
            session.touch();
            session.clone()
        };

        if snapshot.options.persist_history {
            self.services
                .store
                .save(&snapshot)
                .await
                .map_err(ClassifiedError::from)?;
        }
        Ok(SetModeResult { mode: params.mode })
    }

    // -----------------------------------------------------------------
    // cancel
    // -----------------------------------------------------------------

    /// Signal every in-flight operation for the session (or one specific
    /// operation). Idempotent and fast: this only fires tokens, the prompt
    /// call observes them and terminates itself.
    pub fn cancel(&self, params: &CancelParams) -> CancelResult {
        let cancelled = match &params.operation_id {
            Some(operation_id) => self
                .services
                .inflight
                .cancel_operation(&params.session_id, operation_id),
            None => self.services.inflight.cancel_session(&params.session_id),
        };
        CancelResult { cancelled }
    }

    // -----------------------------------------------------------------
    // fs bridge
    // -----------------------------------------------------------------

    pub async fn sandbox_for(
        &self,
        session_id: &str,
    ) -> Result<Arc<ToolSandbox>, OrchestratorError> {
        let session = self.fetch_session(session_id).await?;
        let workspace = self.ensure_workspace(&session).await?;
        Ok(Arc::new(
            self.build_sandbox(&workspace)
                .map_err(ClassifiedError::from)?,
        ))
    }

    fn build_sandbox(&self, workspace: &Workspace) -> crate::error::Result<ToolSandbox> {
        let limits = SandboxLimits {
            max_patch_bytes: self.services.config.max_patch_bytes,
            ..SandboxLimits::default()
        };
        ToolSandbox::new(&workspace.path, limits)
    }

    // -----------------------------------------------------------------
    // session/prompt
    // -----------------------------------------------------------------

    pub async fn run_prompt(
        &self,
        params: PromptParams,
        sink: &dyn UpdateSink,
    ) -> Result<PromptResult, OrchestratorError> {
        if params.content.is_empty() {
            return Err(OrchestratorError::InvalidParams(
                "content must not be empty".to_string(),
            ));
        }
        let session_id = params.session_id.clone();

        let mut session = self.fetch_session(&session_id).await?;
        if session.state.is_terminal() {
            return Err(OrchestratorError::SessionClosed(session_id));
        }
        if let Some(context) = &params.agent_context {
            session.merge_agent_context(context);
        }

        // One prompt per session; the guard frees the registry slot on every
        // exit path.
        let Some(guard) = self.services.inflight.register(&session_id) else {
            return Err(OrchestratorError::SessionBusy(session_id));
        };
        let cancel = guard.token.clone();

        let outcome = self
            .drive_prompt(&mut session, &params, sink, &cancel)
            .await;

        match outcome {
            Ok(drive) => {
                session.append_exchange(Role::User, params.content.clone());
                let mut assistant_blocks =
                    vec![ContentBlock::text(drive.result.full_text.clone())];
                if !drive.tool_trace.is_empty() {
                    assistant_blocks.push(ContentBlock::text(format!(
                        "[tools: {}]",
                        drive.tool_trace.join(", ")
                    )));
                }
                session.append_exchange(Role::Assistant, assistant_blocks);
                session.touch();
                self.commit_session(session).await?;

                sink.send_update(SessionUpdateParams::status(
                    &session_id,
                    UpdateStatus::Completed,
                ))
                .await;

                Ok(PromptResult {
                    stop_reason: StopReason::Completed,
                    usage: Usage {
                        input_tokens: drive.result.tokens.input,
                        output_tokens: drive.result.tokens.output,
                    },
                    summary: drive.summary,
                    github_operations: drive.github_operations,
                    github_automation: None,
                })
            }
            Err(classified) => {
                let stop_reason = match classified.code {
                    ErrorCode::Cancelled => StopReason::Cancelled,
                    ErrorCode::Timeout => StopReason::Timeout,
                    _ => StopReason::Error,
                };
                warn!(session_id, code = classified.code.as_str(), "prompt failed");

                session.touch();
                // Best effort: the session survives a failed prompt.
                if let Err(e) = self.commit_session(session).await {
                    error!("failed to persist session after error: {e}");
                }

                let mut update = SessionUpdateParams::status(&session_id, UpdateStatus::Error);
                update.content = Some(vec![ContentBlock::Error {
                    error: classified.message.clone(),
                }]);
                sink.send_update(update).await;

                Ok(PromptResult {
                    stop_reason,
                    usage: Usage::default(),
                    summary: Some(classified.message),
                    github_operations: None,
                    github_automation: None,
                })
            }
        }
    }

    /// Steps 2–8: everything between in-flight registration and the session
    /// update. Failures here terminate the prompt but not the session.
    async fn drive_prompt(
        &self,
        session: &mut Session,
        params: &PromptParams,
        sink: &dyn UpdateSink,
        cancel: &CancellationToken,
    ) -> Result<DriveOutcome, ClassifiedError> {
        let workspace = tokio::select! {
            workspace = self.ensure_workspace_classified(session) => workspace?,
            _ = cancel.cancelled() => return Err(ClassifiedError::cancelled()),
        };
        let sandbox = Arc::new(self.build_sandbox(&workspace)?);

        // Rehydration happens at most once per loaded session: stored
        // exchanges are sanitized, tail-capped, and queued ahead of the new
        // prompt. Later prompts rely on the appended history instead.
        let replay: Vec<Exchange> = if session.history_replayed {
            Vec::new()
        } else {
            session.message_history.clone()
        };
        session.history_replayed = true;

        let context_files = self.read_context_files(&sandbox, session, params).await;
        let composed = compose(&params.content, &context_files, session.agent_role());
        let new_prompt = AdapterMessage::user(vec![ContentBlock::text(composed.body.clone())]);
        let input = build_adapter_input(&replay, DEFAULT_REPLAY_WINDOW, new_prompt);

        let ctx = AdapterContext {
            api_key: self.services.config.api_key.clone(),
            workspace_path: Some(workspace.path.clone()),
            model: context_value(session, "model"),
            running_as_root: self.services.config.running_as_root,
            disable_streaming_sdk: self.services.config.disable_streaming_sdk,
            force_http_api: self.services.config.force_http_api,
            remote_base_url: None,
            sandbox: Some(Arc::clone(&sandbox)),
        };

        // Adapter events are forwarded as notifications in arrival order;
        // the forwarder also collects the tool trace for the history append.
        let (events_tx, events_rx) = mpsc::channel::<AdapterEvent>(64);
        let run = async {
            let outcome = self
                .services
                .selector
                .run(&composed, &input, &ctx, &events_tx, cancel)
                .await;
            drop(events_tx);
            outcome
        };
        let forwarder = forward_events(events_rx, session.id.clone(), sink);
        let (run_result, tool_trace) = tokio::join!(run, forwarder);
        let result = run_result?;

        let (summary, github_operations) = self
            .post_process(session, &workspace, &sandbox, &composed, &result.full_text)
            .await;

        Ok(DriveOutcome {
            result,
            tool_trace,
            summary,
            github_operations,
        })
    }

    // -----------------------------------------------------------------
    // internals
    // -----------------------------------------------------------------

    async fn fetch_session(&self, session_id: &str) -> Result<Session, OrchestratorError> {
        if let Some(session) = self.sessions.lock().await.get(session_id) {
            return Ok(session.clone());
        }
        match self.services.store.load(session_id).await {
            Ok(Some(session)) => {
                self.sessions
                    .lock()
                    .await
                    .insert(session_id.to_string(), session.clone());
                Ok(session)
            }
            Ok(None) => Err(OrchestratorError::SessionNotFound(session_id.to_string())),
            Err(e) => Err(ClassifiedError::from(e).into()),
        }
    }

    /// Write the mutated session back to the in-memory registry and, when
    /// the session persists history, to the store.
    async fn commit_session(&self, session: Session) -> Result<(), OrchestratorError> {
        let persist = session.options.persist_history;
        let snapshot = session.clone();
        self.sessions
            .lock()
            .await
            .insert(session.id.clone(), session);
        if persist {
            self.services
                .store
                .save(&snapshot)
                .await
                .map_err(ClassifiedError::from)?;
        }
        Ok(())
    }

    async fn prepare_workspace(&self, session: &Session) -> Result<Workspace, ClassifiedError> {
        let opts = PrepareOptions {
            repository_url: session.workspace_uri.clone().filter(|uri| {
                uri.starts_with("http://")
                    || uri.starts_with("https://")
                    || uri.starts_with("git@")
            }),
            base_branch: context_value(session, "baseBranch"),
            working_branch: context_value(session, "workingBranch"),
            token: self.services.config.github_token.clone(),
            reuse: None,
        };

        // Clone/pull failures are often transient; one retry, then surface.
        match self.services.workspaces.prepare(&session.id, &opts).await {
            Ok(workspace) => Ok(workspace),
            Err(first) if first.retryable => {
                debug!(session_id = %session.id, "workspace prepare retrying once");
                self.services.workspaces.prepare(&session.id, &opts).await
            }
            Err(first) => Err(first),
        }
    }

    async fn ensure_workspace_classified(
        &self,
        session: &Session,
    ) -> Result<Workspace, ClassifiedError> {
        if let Some(workspace) = self.workspaces.lock().await.get(&session.id) {
            return Ok(workspace.clone());
        }
        let workspace = self.prepare_workspace(session).await?;
        self.workspaces
            .lock()
            .await
            .insert(session.id.clone(), workspace.clone());
        Ok(workspace)
    }

    async fn ensure_workspace(&self, session: &Session) -> Result<Workspace, OrchestratorError> {
        self.ensure_workspace_classified(session)
            .await
            .map_err(Into::into)
    }

    async fn read_context_files(
        &self,
        sandbox: &Arc<ToolSandbox>,
        session: &Session,
        params: &PromptParams,
    ) -> Vec<ContextFile> {
        let mut paths: Vec<String> = session.options.context_files.clone();
        if let Some(extra) = &params.context_files {
            paths.extend(extra.iter().cloned());
        }
        paths.dedup();

        let mut files = Vec::new();
        for path in paths {
            match sandbox.read_file(&path).await {
                Ok(read) => files.push(ContextFile {
                    path,
                    content: read.content,
                }),
                Err(e) => warn!(path, "skipping unreadable context file: {e}"),
            }
        }
        files
    }

    /// Output post-processing. Fenced ```diff/```patch blocks are applied
    /// through the git service; otherwise a single inferred file write may go
    /// through the sandbox. A response with neither is conversational and
    /// mutates nothing.
    async fn post_process(
        &self,
        session: &Session,
        workspace: &Workspace,
        sandbox: &Arc<ToolSandbox>,
        composed: &ComposedPrompt,
        full_text: &str,
    ) -> (Option<String>, Option<Vec<GithubOperation>>) {
        let mut notes: Vec<String> = Vec::new();

        let patches = extract_patches(full_text, self.services.config.max_patch_bytes);
        if !patches.is_empty() {
            let mut applied = 0usize;
            for patch in &patches {
                match self.services.workspaces.apply_patch(workspace, patch).await {
                    Ok(()) => applied += 1,
                    Err(e) => warn!("patch failed to apply: {e}"),
                }
            }
            notes.push(format!("applied {applied}/{} patch(es)", patches.len()));
        } else if let Some((path, content)) = propose_file_write(&composed.body, full_text) {
            match sandbox.write_file(&path, &content).await {
                Ok(_) => notes.push(format!("wrote {path}")),
                Err(e) => warn!(path, "inferred file write failed: {e}"),
            }
        }

        let github_operations = if session.options.enable_git_ops {
            self.run_git_automation(session, workspace, &mut notes).await
        } else {
            None
        };

        let summary = (!notes.is_empty()).then(|| notes.join("; "));
        (summary, github_operations)
    }

    async fn run_git_automation(
        &self,
        session: &Session,
        workspace: &Workspace,
        notes: &mut Vec<String>,
    ) -> Option<Vec<GithubOperation>> {
        let mut operations = Vec::new();

        match self.services.workspaces.diff_status(workspace).await {
            Ok(status) if status.is_dirty() => {
                let message = context_value(session, "commitMessage")
                    .unwrap_or_else(|| format!("Agent changes for session {}", session.id));
                match self
                    .services
                    .workspaces
                    .commit_all(workspace, &message, "Agent Gateway", "agent@gateway.local")
                    .await
                {
                    Ok(sha) => {
                        notes.push(format!("committed {}", &sha[..sha.len().min(12)]));
                        operations.push(GithubOperation {
                            operation: "commit".to_string(),
                            success: true,
                            detail: Some(sha),
                        });
                    }
                    Err(e) => {
                        operations.push(GithubOperation {
                            operation: "commit".to_string(),
                            success: false,
                            detail: Some(e.message.clone()),
                        });
                    }
                }

                if let Some(branch) = context_value(session, "workingBranch") {
                    let pushed = self
                        .services
                        .workspaces
                        .push(
                            workspace,
                            &branch,
                            self.services.config.github_token.as_deref(),
                        )
                        .await;
                    operations.push(GithubOperation {
                        operation: "push".to_string(),
                        success: pushed.is_ok(),
                        detail: pushed.err().map(|e| e.message),
                    });
                }
            }
            Ok(_) => debug!("working tree clean, nothing to commit"),
            Err(e) => warn!("diff status failed: {e}"),
        }

        if self.services.github.is_enabled()
            && let Some(target) = session.agent_context.get("pullRequest")
        {
            let spec = PullRequestSpec {
                repository: target
                    .get("repository")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                base_branch: target
                    .get("baseBranch")
                    .and_then(Value::as_str)
                    .unwrap_or("main")
                    .to_string(),
                head_branch: context_value(session, "workingBranch").unwrap_or_default(),
                title: target
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or("Agent changes")
                    .to_string(),
                body: target
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
            match self
                .services
                .github
                .create_or_update_pull_request(spec)
                .await
            {
                Ok(op) => operations.push(op),
                Err(e) => operations.push(GithubOperation {
                    operation: "create_pull_request".to_string(),
                    success: false,
                    detail: Some(e.message),
                }),
            }
        }

        (!operations.is_empty()).then_some(operations)
    }
}

fn context_value(session: &Session, key: &str) -> Option<String> {
    session
        .agent_context
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn workspace_info(workspace: &Workspace) -> WorkspaceInfo {
    WorkspaceInfo {
        root_path: workspace.path.to_string_lossy().into_owned(),
        git_branch: workspace
            .git_info
            .as_ref()
            .and_then(|info| info.current_branch.clone()),
        has_uncommitted_changes: workspace
            .git_info
            .as_ref()
            .map(|info| info.has_uncommitted_changes)
            .unwrap_or(false),
    }
}

/// Forward adapter events to the sink as `session/update` notifications,
/// returning a one-line trace per tool call for the history append.
async fn forward_events(
    mut events: mpsc::Receiver<AdapterEvent>,
    session_id: String,
    sink: &dyn UpdateSink,
) -> Vec<String> {
    let mut trace = Vec::new();
    while let Some(event) = events.recv().await {
        match event {
            AdapterEvent::Started => {
                sink.send_update(SessionUpdateParams::status(
                    &session_id,
                    UpdateStatus::Thinking,
                ))
                .await;
            }
            AdapterEvent::Delta { text } => {
                let mut update = SessionUpdateParams::status(&session_id, UpdateStatus::Working);
                update.content = Some(vec![ContentBlock::text(text)]);
                sink.send_update(update).await;
            }
            AdapterEvent::ToolCall { name, input, .. } => {
                let mut update = SessionUpdateParams::status(&session_id, UpdateStatus::Working);
                update.tool_call = Some(ToolCallUpdate {
                    name,
                    raw_input: input,
                });
                sink.send_update(update).await;
            }
            AdapterEvent::ToolResult {
                name,
                output,
                is_error,
                ..
            } => {
                trace.push(format!("{name}({})", if is_error { "error" } else { "ok" }));
                let mut update = SessionUpdateParams::status(&session_id, UpdateStatus::Working);
                update.tool_result = Some(ToolResultUpdate {
                    name,
                    status: if is_error {
                        ToolResultStatus::Error
                    } else {
                        ToolResultStatus::Ok
                    },
                    output: Some(output),
                });
                sink.send_update(update).await;
            }
            AdapterEvent::Completed { .. } => {}
        }
    }
    trace
}
