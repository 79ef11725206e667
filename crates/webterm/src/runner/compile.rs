//! Compilation step for code execution
//!
//! Runs the language's compiler inside the request directory. Compiler
//! output is collected, not streamed.

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::Language;
use crate::process;
use crate::runner::{CompileError, Runner};
use crate::types::ExecutionLimits;
use crate::workspace::Workspace;

/// Result of a successful compilation
#[derive(Debug, Clone, Default)]
pub struct CompileResult {
    /// Compiler stderr that was not treated as an error
    pub warnings: Option<String>,

    /// Wall-clock time of the compiler run in milliseconds
    pub duration_ms: u64,
}

impl Runner {
    /// Compile the workspace source
    #[instrument(skip_all, fields(language = %language.name))]
    pub async fn compile(
        &self,
        workspace: &Workspace,
        language: &Language,
        overrides: Option<&ExecutionLimits>,
        cancel: &CancellationToken,
    ) -> Result<CompileResult, CompileError> {
        let compile_config = language
            .compile
            .as_ref()
            .ok_or_else(|| CompileError::NotCompiled(language.name.clone()))?;

        let limits = self.compile_limits(language, overrides);
        let timeout_ms = limits.timeout().as_millis();
        let command = self.command(
            &compile_config.command,
            &compile_config.env,
            workspace,
            limits,
        )?;

        let output = process::run(&command, cancel, None).await?;

        if output.cancelled {
            return Err(CompileError::Cancelled);
        }
        if output.timed_out {
            return Err(CompileError::Timeout(
                u64::try_from(timeout_ms).unwrap_or(u64::MAX),
            ));
        }

        // Combined compiler output, stdout first
        let mut diagnostic = output.stdout.clone();
        if !diagnostic.is_empty() && !output.stderr.is_empty() && !diagnostic.ends_with('\n') {
            diagnostic.push('\n');
        }
        diagnostic.push_str(&output.stderr);

        let has_stderr = !output.stderr.trim().is_empty();
        if output.exit_code != Some(0) || (has_stderr && compile_config.warnings_are_errors) {
            debug!(exit_code = ?output.exit_code, "compilation failed");
            return Err(CompileError::Failed {
                exit_code: output.exit_code,
                output: diagnostic,
            });
        }

        if !workspace.has_artifact().await {
            return Err(CompileError::Failed {
                exit_code: output.exit_code,
                output: format!(
                    "compiler produced no {}",
                    workspace.artifact_name().unwrap_or("output")
                ),
            });
        }

        debug!(duration_ms = output.duration_ms(), "compilation complete");

        Ok(CompileResult {
            warnings: has_stderr.then(|| output.stderr.clone()),
            duration_ms: output.duration_ms(),
        })
    }
}
