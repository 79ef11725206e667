//! Execution sessions
//!
//! One [`ExecutionSession`] per connected client. A session runs at most one
//! execution at a time and reports everything it does as a stream of
//! [`SessionEvent`]s: zero or more output chunks followed by exactly one
//! completion.
//!
//! ```text
//! Idle -> Preparing -> [Compiling] -> Running -> Completed
//!              \            \            \----> Failed(outcome) | Cancelled
//!               \            \----------------> Failed(outcome) | Cancelled
//!                \----------------------------> Failed(InternalError)
//! Completed | Failed | Cancelled --cleanup--> Idle
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

pub use crate::session::events::{
    ClientEvent, CompletionPayload, ExecutePayload, MessagePayload, OutputPayload, ServerEvent,
    ServerInfo,
};
pub use crate::session::preferences::{PreferenceHandle, PreferenceStore, Preferences};

pub mod events;
mod preferences;

use crate::config::{Config, ConfigError};
use crate::registry::LanguageRegistry;
use crate::runner::{CompileError, Runner};
use crate::types::{DEFAULT_TIMEOUT_MS, ExecutionLimits, ExecutionResult, Outcome, OutputChunk};
use crate::workspace::{SessionId, Workspace, WorkspaceManager};

/// Buffered output chunks between the process readers and the client
const CHUNK_BUFFER: usize = 64;

/// Errors returned when an execution cannot start
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("an execution is already in progress")]
    Busy,
}

/// Where a session is in its lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Preparing,
    Compiling,
    Running,
    Completed,
    Failed(Outcome),
    Cancelled,
}

impl SessionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, SessionState::Idle)
    }

    fn terminal(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => SessionState::Completed,
            Outcome::Cancelled => SessionState::Cancelled,
            other => SessionState::Failed(other),
        }
    }
}

/// Observable side effects of a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Output(OutputChunk),
    Complete(ExecutionResult),
}

/// One request to run code
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,

    /// Language id, matched case-insensitively
    pub language: String,

    /// Caller limits, layered over the language and default limits
    pub limits: Option<ExecutionLimits>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            limits: None,
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = Some(limits);
        self
    }
}

/// Process-wide collaborators shared by every session
#[derive(Debug)]
pub struct Backend {
    pub registry: LanguageRegistry,
    pub workspaces: WorkspaceManager,
    pub runner: Runner,
}

impl Backend {
    pub fn new(config: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            registry: LanguageRegistry::from_config(config)?,
            workspaces: WorkspaceManager::new(&config.workspace_root),
            runner: Runner::new(config),
        })
    }
}

#[derive(Debug)]
struct Slot {
    state: SessionState,
    cancel: Option<CancellationToken>,
}

#[derive(Debug)]
struct Inner {
    id: SessionId,
    backend: Arc<Backend>,
    preferences: PreferenceHandle,
    events: mpsc::Sender<SessionEvent>,
    slot: Mutex<Slot>,
}

/// Per-client execution state machine.
///
/// Cheap to clone; clones share the same state.
#[derive(Debug, Clone)]
pub struct ExecutionSession {
    inner: Arc<Inner>,
}

impl ExecutionSession {
    pub fn new(
        id: SessionId,
        backend: Arc<Backend>,
        preferences: PreferenceHandle,
        events: mpsc::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                id,
                backend,
                preferences,
                events,
                slot: Mutex::new(Slot {
                    state: SessionState::Idle,
                    cancel: None,
                }),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn state(&self) -> SessionState {
        self.lock_slot().state
    }

    pub fn preferences(&self) -> &PreferenceHandle {
        &self.inner.preferences
    }

    /// Start an execution in the background.
    ///
    /// Fails immediately with [`SessionError::Busy`] unless the session is
    /// idle. The returned task resolves after the completion event was sent.
    pub fn start(
        &self,
        request: ExecutionRequest,
    ) -> Result<JoinHandle<ExecutionResult>, SessionError> {
        let cancel = self.begin()?;
        let session = self.clone();

        Ok(tokio::spawn(async move {
            let language = request.language.clone();
            let worker = {
                let session = session.clone();
                tokio::spawn(async move { session.execute(request, cancel).await })
            };

            match worker.await {
                Ok(result) => result,
                Err(e) => {
                    // The worker died before it could report; the client
                    // still gets its completion.
                    error!(session = %session.id(), error = %e, "execution task failed");
                    let result = ExecutionResult::with_outcome(language, Outcome::InternalError);
                    session
                        .emit(SessionEvent::Output(OutputChunk::error(INTERNAL_ERROR_MESSAGE)))
                        .await;
                    session.emit(SessionEvent::Complete(result.clone())).await;
                    result
                }
            }
        }))
    }

    /// Run an execution to completion
    pub async fn run(&self, request: ExecutionRequest) -> Result<ExecutionResult, SessionError> {
        let language = request.language.clone();
        let handle = self.start(request)?;
        Ok(handle.await.unwrap_or_else(|e| {
            error!(session = %self.id(), error = %e, "execution supervisor failed");
            ExecutionResult::with_outcome(language, Outcome::InternalError)
        }))
    }

    /// Stop the running execution, if any.
    ///
    /// Returns whether there was something to stop.
    pub fn cancel(&self) -> bool {
        let slot = self.lock_slot();
        match slot.cancel {
            Some(ref token) if !token.is_cancelled() => {
                info!(session = %self.id(), state = ?slot.state, "cancelling execution");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel anything in flight and remove the session directory
    pub async fn teardown(&self) {
        self.cancel();
        self.inner
            .backend
            .workspaces
            .teardown_session(self.id())
            .await;
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, Slot> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Idle -> Preparing, atomically
    fn begin(&self) -> Result<CancellationToken, SessionError> {
        let mut slot = self.lock_slot();
        if !slot.state.is_idle() {
            debug!(session = %self.id(), state = ?slot.state, "rejecting execute, session busy");
            return Err(SessionError::Busy);
        }
        let token = CancellationToken::new();
        slot.state = SessionState::Preparing;
        slot.cancel = Some(token.clone());
        Ok(token)
    }

    fn set_state(&self, state: SessionState) {
        self.lock_slot().state = state;
    }

    async fn emit(&self, event: SessionEvent) {
        // The client may already be gone; nothing left to tell it
        let _ = self.inner.events.send(event).await;
    }

    fn reset_idle(&self) {
        let mut slot = self.lock_slot();
        slot.state = SessionState::Idle;
        slot.cancel = None;
    }

    #[instrument(skip_all, fields(session = %self.id(), language = %request.language))]
    async fn execute(&self, request: ExecutionRequest, cancel: CancellationToken) -> ExecutionResult {
        let idle = IdleGuard {
            session: self,
            armed: true,
        };

        let (chunks, rx) = mpsc::channel(CHUNK_BUFFER);
        let forwarder = tokio::spawn(forward(rx, self.inner.events.clone()));

        let finished = self.pipeline(&request, &cancel, &chunks).await;
        let result = finished.result;

        if let Some(line) = closing_line(&result, finished.phase_timeout_ms) {
            let _ = chunks.send(OutputChunk::error(line)).await;
        }
        drop(chunks);
        if let Err(e) = forwarder.await {
            warn!(error = %e, "output forwarder failed");
        }

        if let Some(ref workspace) = finished.workspace {
            self.inner.backend.workspaces.cleanup(workspace).await;
        }

        self.set_state(SessionState::terminal(result.outcome));
        info!(
            outcome = %result.outcome,
            duration_ms = result.duration_ms,
            exit_code = ?result.exit_code,
            "execution finished"
        );

        // Go idle only once the completion has a slot in the channel: the
        // client may submit again as soon as it sees it, and nothing from a
        // newer execution may overtake it.
        let permit = self.inner.events.reserve().await;
        idle.release();
        if let Ok(permit) = permit {
            permit.send(SessionEvent::Complete(result.clone()));
        }
        result
    }

    /// Materialize, compile and run
    async fn pipeline(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
        chunks: &mpsc::Sender<OutputChunk>,
    ) -> Finished {
        let backend = &self.inner.backend;
        let progress = Progress {
            chunks,
            enabled: self.inner.preferences.get().show_progress,
        };

        let resolved = backend.registry.resolve(&request.language);
        if let Some(requested) = resolved.fallback_from {
            let notice = format!(
                "Language {requested} is not supported, using {} instead.\r\n",
                resolved.id
            );
            let _ = chunks.send(OutputChunk::error(notice)).await;
        }
        let language = resolved.language;
        let mut finished = Finished {
            result: ExecutionResult::with_outcome(resolved.id, Outcome::InternalError),
            workspace: None,
            phase_timeout_ms: 0,
        };

        progress
            .say(format!("[webterm] Executing {} code...\r\n", resolved.id))
            .await;

        let workspace = match backend
            .workspaces
            .materialize(self.id(), &request.code, language)
            .await
        {
            Ok(workspace) => workspace,
            Err(e) => {
                error!(error = %e, "failed to prepare workspace");
                return finished;
            }
        };
        let workspace = &*finished.workspace.insert(workspace);
        progress.say("Code file created successfully.\r\n").await;

        if cancel.is_cancelled() {
            finished.result.outcome = Outcome::Cancelled;
            return finished;
        }

        if language.is_compiled() {
            self.set_state(SessionState::Compiling);
            progress
                .say(format!("Compiling {} code...\r\n", resolved.id))
                .await;

            let limits = backend.runner.compile_limits(language, request.limits.as_ref());
            finished.phase_timeout_ms = limits.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

            match backend
                .runner
                .compile(workspace, language, request.limits.as_ref(), cancel)
                .await
            {
                Ok(compiled) => {
                    if let Some(warnings) = compiled.warnings {
                        let text = format!("Warnings: {warnings}\r\n");
                        let _ = chunks.send(OutputChunk::notice(text)).await;
                    }
                    progress
                        .say("Compilation successful. Running code...\r\n")
                        .await;
                }
                Err(CompileError::Failed { output, .. }) => {
                    let text = format!("Compilation error: {output}\r\n");
                    let _ = chunks.send(OutputChunk::error(text)).await;
                    finished.result.outcome = Outcome::CompileError;
                    finished.result.diagnostic = Some(output);
                    return finished;
                }
                Err(CompileError::Timeout(ms)) => {
                    finished.phase_timeout_ms = ms;
                    finished.result.outcome = Outcome::Timeout;
                    return finished;
                }
                Err(CompileError::Cancelled) => {
                    finished.result.outcome = Outcome::Cancelled;
                    return finished;
                }
                Err(e) => {
                    error!(error = %e, "compiler could not be run");
                    return finished;
                }
            }
        } else {
            progress
                .say(format!("Running {} code...\r\n", resolved.id))
                .await;
        }

        self.set_state(SessionState::Running);
        let limits = backend.runner.run_limits(language, request.limits.as_ref());
        finished.phase_timeout_ms = limits.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS);

        let output = match backend
            .runner
            .execute(
                workspace,
                language,
                request.limits.as_ref(),
                cancel,
                Some(chunks),
            )
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(error = %e, "program could not be started");
                return finished;
            }
        };

        let result = &mut finished.result;
        result.outcome = if output.cancelled {
            Outcome::Cancelled
        } else if output.timed_out {
            Outcome::Timeout
        } else if output.exit_code == Some(0) {
            Outcome::Success
        } else {
            Outcome::RuntimeError
        };
        result.duration_ms = output.duration_ms();
        result.exit_code = output.exit_code;
        result.signal = output.signal;
        result.truncated = output.truncated;
        result.stdout = output.stdout;
        result.stderr = output.stderr;

        finished
    }
}

/// What the pipeline produced and what is left to clean up
struct Finished {
    result: ExecutionResult,
    workspace: Option<Workspace>,
    /// Budget of the last phase that started
    phase_timeout_ms: u64,
}

/// Progress notices, suppressed when the client turned them off
struct Progress<'a> {
    chunks: &'a mpsc::Sender<OutputChunk>,
    enabled: bool,
}

impl Progress<'_> {
    async fn say(&self, text: impl Into<String>) {
        if self.enabled {
            let _ = self.chunks.send(OutputChunk::notice(text)).await;
        }
    }
}

const INTERNAL_ERROR_MESSAGE: &str =
    "\r\nInternal error: the code could not be executed. Please try again.\r\n";

/// Closing line for failed executions
fn closing_line(result: &ExecutionResult, timeout_ms: u64) -> Option<String> {
    let line = match result.outcome {
        Outcome::Success | Outcome::CompileError => return None,
        Outcome::Timeout => format!("\r\nExecution timed out after {timeout_ms} ms\r\n"),
        Outcome::RuntimeError => match (result.exit_code, result.signal) {
            (Some(code), _) => format!("\r\nProcess exited with code {code}\r\n"),
            (None, Some(signal)) => format!("\r\nProcess killed by signal {signal}\r\n"),
            (None, None) => "\r\nProcess exited abnormally\r\n".to_owned(),
        },
        Outcome::Cancelled => "\r\nExecution cancelled\r\n".to_owned(),
        Outcome::InternalError => INTERNAL_ERROR_MESSAGE.to_owned(),
    };
    Some(line)
}

/// Relays output chunks to the session's event channel in order
async fn forward(mut rx: mpsc::Receiver<OutputChunk>, events: mpsc::Sender<SessionEvent>) {
    while let Some(chunk) = rx.recv().await {
        if events.send(SessionEvent::Output(chunk)).await.is_err() {
            // Keep draining so producers never block on a dead client
            while rx.recv().await.is_some() {}
            return;
        }
    }
}

/// Returns the session to `Idle` even if the execution task unwinds
struct IdleGuard<'a> {
    session: &'a ExecutionSession,
    armed: bool,
}

impl IdleGuard<'_> {
    /// Go idle now; a later drop leaves the next execution alone
    fn release(mut self) {
        self.session.reset_idle();
        self.armed = false;
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.session.reset_idle();
        }
    }
}
