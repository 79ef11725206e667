use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default wall-clock budget for one phase, in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Default ceiling for each captured stream, in bytes
pub const DEFAULT_MAX_OUTPUT_BYTES: u64 = 1_048_576;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLimits {
    /// Wall clock limit for a single phase (compile or run) in milliseconds
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Maximum bytes captured per stream (stdout and stderr are bounded separately)
    #[serde(default)]
    pub max_output_bytes: Option<u64>,
}

impl ExecutionLimits {
    /// 1 kilobyte in bytes
    pub const KB: u64 = 1024;
    /// 1 megabyte in bytes
    pub const MB: u64 = 1024 * 1024;

    /// Create new limits populated with the defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Create limits with every field unset, for use as a sparse override
    pub fn unset() -> Self {
        Self {
            timeout_ms: None,
            max_output_bytes: None,
        }
    }

    /// Set the wall clock limit in milliseconds
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Set the per-stream output ceiling in bytes
    pub fn with_max_output_bytes(mut self, bytes: u64) -> Self {
        self.max_output_bytes = Some(bytes);
        self
    }

    /// Apply overrides from another ExecutionLimits, preferring values from `overrides`
    pub fn with_overrides(&self, overrides: &ExecutionLimits) -> ExecutionLimits {
        ExecutionLimits {
            timeout_ms: overrides.timeout_ms.or(self.timeout_ms),
            max_output_bytes: overrides.max_output_bytes.or(self.max_output_bytes),
        }
    }

    /// Effective timeout, falling back to [`DEFAULT_TIMEOUT_MS`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// Effective per-stream ceiling, falling back to [`DEFAULT_MAX_OUTPUT_BYTES`]
    pub fn max_output(&self) -> usize {
        let bytes = self.max_output_bytes.unwrap_or(DEFAULT_MAX_OUTPUT_BYTES);
        usize::try_from(bytes).unwrap_or(usize::MAX)
    }
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            timeout_ms: Some(DEFAULT_TIMEOUT_MS),
            max_output_bytes: Some(DEFAULT_MAX_OUTPUT_BYTES),
        }
    }
}

/// Terminal classification of an execution attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// Program exited with code 0
    Success,

    /// The compile phase failed; the run phase never started
    CompileError,

    /// Program was spawned but exited non-zero or was killed by a signal
    RuntimeError,

    /// Wall clock budget exceeded, the process group was killed
    Timeout,

    /// The platform failed (workspace, spawn, missing toolchain)
    InternalError,

    /// Stopped on request of the client
    Cancelled,
}

impl Outcome {
    /// Whether this outcome is a failure the client should render as such
    #[must_use]
    pub fn is_failure(&self) -> bool {
        !matches!(self, Outcome::Success)
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Outcome::Success => "success",
            Outcome::CompileError => "compile error",
            Outcome::RuntimeError => "runtime error",
            Outcome::Timeout => "timeout",
            Outcome::InternalError => "internal error",
            Outcome::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Result of one execution request
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Language id that actually ran (after fallback)
    pub language: String,

    /// Terminal classification
    pub outcome: Outcome,

    /// Captured standard output of the run phase
    pub stdout: String,

    /// Captured standard error of the run phase
    pub stderr: String,

    /// Compiler output when the compile phase produced any
    pub diagnostic: Option<String>,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the program was killed by a signal
    pub signal: Option<i32>,

    /// Wall clock time of the run phase in milliseconds
    pub duration_ms: u64,

    /// Whether either stream hit the output ceiling
    pub truncated: bool,
}

impl ExecutionResult {
    /// Empty result for `language` with the given outcome
    pub fn with_outcome(language: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            language: language.into(),
            outcome,
            ..Default::default()
        }
    }

    /// Check if the execution was successful (exited with code 0)
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success) && self.exit_code == Some(0)
    }
}

impl Default for ExecutionResult {
    fn default() -> Self {
        Self {
            language: String::new(),
            outcome: Outcome::InternalError,
            stdout: String::new(),
            stderr: String::new(),
            diagnostic: None,
            exit_code: None,
            signal: None,
            duration_ms: 0,
            truncated: false,
        }
    }
}

/// Origin of an output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Bytes read from the program's stdout
    Stdout,
    /// Bytes read from the program's stderr
    Stderr,
    /// Progress notice from the dispatcher
    Notice,
    /// Error notice from the dispatcher
    Error,
}

/// A piece of text relayed to the client in production order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub kind: ChunkKind,
    pub text: String,
}

impl OutputChunk {
    pub fn stdout(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Stdout,
            text: text.into(),
        }
    }

    pub fn stderr(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Stderr,
            text: text.into(),
        }
    }

    pub fn notice(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Notice,
            text: text.into(),
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Error,
            text: text.into(),
        }
    }

    /// Whether the client should render this chunk as an error
    #[must_use]
    pub fn is_error(&self) -> bool {
        matches!(self.kind, ChunkKind::Stderr | ChunkKind::Error)
    }
}
