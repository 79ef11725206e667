//! Execution step for code running
//!
//! Runs the compiled artifact or hands the source to the interpreter,
//! streaming output as it is produced.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::config::Language;
use crate::process::{self, ProcessOutput};
use crate::runner::{ExecuteError, Runner};
use crate::types::{ExecutionLimits, OutputChunk};
use crate::workspace::Workspace;

impl Runner {
    /// Run the program in `workspace`
    #[instrument(skip_all, fields(language = %language.name))]
    pub async fn execute(
        &self,
        workspace: &Workspace,
        language: &Language,
        overrides: Option<&ExecutionLimits>,
        cancel: &CancellationToken,
        sink: Option<&mpsc::Sender<OutputChunk>>,
    ) -> Result<ProcessOutput, ExecuteError> {
        if language.is_compiled() {
            if !workspace.has_artifact().await {
                return Err(ExecuteError::NotStarted(format!(
                    "artifact '{}' not found - was compilation run?",
                    workspace.artifact_name().unwrap_or_default()
                )));
            }
        } else if !tokio::fs::try_exists(&workspace.source_file)
            .await
            .unwrap_or(false)
        {
            return Err(ExecuteError::NotStarted(format!(
                "source '{}' not found - write source first",
                workspace.source_name()
            )));
        }

        let limits = self.run_limits(language, overrides);
        let command = self.command(&language.run.command, &language.run.env, workspace, limits)?;
        debug!(program = command.program(), "executing program");

        Ok(process::run(&command, cancel, sink).await?)
    }
}
