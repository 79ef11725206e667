//! Command builder for supervised processes
//!
//! Holds an argument vector plus the environment, working directory and
//! limits it runs under. Never goes through a shell.

use std::collections::BTreeMap;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::DEFAULT_PATH;
use crate::process::ProcessError;
use crate::types::ExecutionLimits;

/// Builder for one external process invocation
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    program: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
    /// Complete environment of the child; nothing is inherited
    env: BTreeMap<String, String>,
    limits: ExecutionLimits,
}

impl ProcessCommand {
    /// Create a command from an argument vector
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>) -> Result<Self, ProcessError> {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .filter(|p: &String| !p.is_empty())
            .ok_or(ProcessError::EmptyCommand)?;
        Ok(Self {
            program,
            args: argv.collect(),
            working_dir: None,
            env: BTreeMap::new(),
            limits: ExecutionLimits::default(),
        })
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set several environment variables
    pub fn envs<K, V>(mut self, vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Set the timeout and output limits
    pub fn limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn get_working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn get_env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn get_limits(&self) -> &ExecutionLimits {
        &self.limits
    }

    /// Build the tokio command.
    ///
    /// The child leads its own process group so the whole tree can be
    /// signalled at once, starts with a cleared environment and gets no stdin.
    pub(crate) fn build(&self) -> Result<Command, ProcessError> {
        let program = self.resolve_program()?;

        let mut cmd = Command::new(program);
        cmd.args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    /// Resolve the program against the child's PATH.
    ///
    /// Relative paths such as `./compiled_c` are anchored at the working
    /// directory; bare names are searched in the PATH the child will see.
    fn resolve_program(&self) -> Result<PathBuf, ProcessError> {
        if self.program.contains('/') {
            let path = Path::new(&self.program);
            return Ok(match self.working_dir {
                Some(ref dir) if path.is_relative() => dir.join(path),
                _ => path.to_path_buf(),
            });
        }

        let path_var = self
            .env
            .get("PATH")
            .map(String::as_str)
            .unwrap_or(DEFAULT_PATH);
        resolve_command(&self.program, path_var)
    }
}

/// Find `name` in a colon-separated `path_var`
pub fn resolve_command(name: &str, path_var: &str) -> Result<PathBuf, ProcessError> {
    path_var
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| ProcessError::CommandNotFound(name.to_owned()))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}
