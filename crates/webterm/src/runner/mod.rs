//! Code runner for webterm
//!
//! Turns a language configuration and a materialized workspace into
//! supervised compile and run processes.

use std::collections::BTreeMap;

use thiserror::Error;

pub use crate::runner::compile::CompileResult;

mod compile;
mod execute;

use crate::config::{Config, Language};
use crate::process::{ProcessCommand, ProcessError};
use crate::types::ExecutionLimits;
use crate::workspace::Workspace;

/// Errors that occur during compilation
#[derive(Debug, Error)]
pub enum CompileError {
    #[error("compilation failed with exit code {exit_code:?}: {output}")]
    Failed {
        exit_code: Option<i32>,
        output: String,
    },

    #[error("compilation timed out after {0} ms")]
    Timeout(u64),

    #[error("compilation cancelled")]
    Cancelled,

    #[error("language '{0}' does not support compilation")]
    NotCompiled(String),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),
}

/// Errors that occur before a program could be started
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("execution not started: {0}")]
    NotStarted(String),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),
}

/// Builds and supervises compile and run processes
#[derive(Debug, Clone)]
pub struct Runner {
    /// Allow-listed host environment handed to every process
    env: BTreeMap<String, String>,
    default_limits: ExecutionLimits,
}

impl Runner {
    /// Create a runner from the configuration, snapshotting the allowed environment
    pub fn new(config: &Config) -> Self {
        Self {
            env: config.sandbox_env(),
            default_limits: config.default_limits.clone(),
        }
    }

    /// Create a runner with an explicit environment
    pub fn with_env(env: BTreeMap<String, String>, default_limits: ExecutionLimits) -> Self {
        Self {
            env,
            default_limits,
        }
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Limits for the compile phase: defaults, then language, then caller
    pub fn compile_limits(
        &self,
        language: &Language,
        overrides: Option<&ExecutionLimits>,
    ) -> ExecutionLimits {
        let lang = language.compile.as_ref().and_then(|c| c.limits.as_ref());
        self.layer_limits(lang, overrides)
    }

    /// Limits for the run phase: defaults, then language, then caller
    pub fn run_limits(
        &self,
        language: &Language,
        overrides: Option<&ExecutionLimits>,
    ) -> ExecutionLimits {
        self.layer_limits(language.run.limits.as_ref(), overrides)
    }

    fn layer_limits(
        &self,
        lang: Option<&ExecutionLimits>,
        overrides: Option<&ExecutionLimits>,
    ) -> ExecutionLimits {
        let mut limits = self.default_limits.clone();
        if let Some(lang) = lang {
            limits = limits.with_overrides(lang);
        }
        if let Some(overrides) = overrides {
            limits = limits.with_overrides(overrides);
        }
        limits
    }

    /// Expand a command template for `workspace` and attach environment and limits
    fn command(
        &self,
        template: &[String],
        extra_env: &BTreeMap<String, String>,
        workspace: &Workspace,
        limits: ExecutionLimits,
    ) -> Result<ProcessCommand, ProcessError> {
        let dir = workspace.request_dir.to_string_lossy();
        let argv = Language::expand_command(
            template,
            workspace.source_name(),
            workspace.artifact_name().unwrap_or_default(),
            &dir,
        );
        Ok(ProcessCommand::new(argv)?
            .working_dir(&workspace.request_dir)
            .envs(self.env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .envs(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())))
            .limits(limits))
    }
}
