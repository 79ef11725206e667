//! Remote code execution for a browser code playground.
//!
//! webterm takes `(code, language)` from a connected client, writes the code
//! into a per-session workspace, runs the matching compiler and interpreter as
//! supervised subprocesses, and streams the output back as ordered events.
//!
//! # Features
//!
//! - **Language table** — TOML-configured toolchains with compile and run
//!   command templates, case-insensitive lookup and a fallback language.
//! - **Workspaces** — Per-session directories with uniquely named request
//!   subdirectories, removed after every execution.
//! - **Process supervision** — Wall-clock timeouts, per-stream output
//!   ceilings and process-group kill on timeout or stop.
//! - **Sessions** — One execution in flight per client, explicit cancellation,
//!   and exactly one completion event per request.
//! - **Transport-agnostic dispatch** — A `{type, payload}` JSON protocol
//!   served over any stream of client events.

pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use process::{ProcessCommand, ProcessError, ProcessOutput};
pub use registry::{LanguageRegistry, Resolved};
pub use runner::{CompileError, CompileResult, ExecuteError, Runner};
pub use session::{
    Backend, ClientEvent, ExecutionRequest, ExecutionSession, PreferenceStore, Preferences,
    ServerEvent, SessionError, SessionEvent, SessionState,
};
pub use transport::{Dispatcher, Health};
pub use types::{ChunkKind, ExecutionLimits, ExecutionResult, Outcome, OutputChunk};
pub use workspace::{SessionId, Workspace, WorkspaceError, WorkspaceManager};

pub mod config;
pub mod process;
pub mod registry;
pub mod runner;
pub mod session;
pub mod transport;
pub mod types;
pub mod workspace;
