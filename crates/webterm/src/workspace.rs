//! Workspace lifecycle management
//!
//! Every session owns a directory under the workspace root. Each execution
//! request gets its own subdirectory inside it, holding the generated source
//! file and the compiled artifact (if any), so concurrent requests never
//! clobber each other's files.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::Language;

const MAX_SESSION_ID_LEN: usize = 64;

/// Errors that occur while preparing a workspace
#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write source file {path}: {source}")]
    WriteSource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque identifier of one client session.
///
/// Restricted to characters that are safe as a single path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Result<Self, WorkspaceError> {
        let id = id.into();
        let valid = !id.is_empty()
            && id.len() <= MAX_SESSION_ID_LEN
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(WorkspaceError::InvalidSessionId(id));
        }
        Ok(Self(id))
    }

    /// Fresh random session id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Files backing one execution request
#[derive(Debug, Clone)]
pub struct Workspace {
    /// Session directory, shared by the session's requests
    pub root_dir: PathBuf,

    /// Per-request directory; also the working directory of the processes
    pub request_dir: PathBuf,

    /// Materialized source file
    pub source_file: PathBuf,

    /// Where the compiler is expected to write its output
    pub artifact_file: Option<PathBuf>,
}

impl Workspace {
    /// Source file name relative to the request directory
    pub fn source_name(&self) -> &str {
        file_name(&self.source_file)
    }

    /// Artifact file name relative to the request directory
    pub fn artifact_name(&self) -> Option<&str> {
        self.artifact_file.as_deref().map(file_name)
    }

    /// Whether the compiled artifact exists on disk
    pub async fn has_artifact(&self) -> bool {
        match self.artifact_file {
            Some(ref path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            None => false,
        }
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or_default()
}

/// Creates and removes workspaces under a process-wide root
#[derive(Debug)]
pub struct WorkspaceManager {
    root: PathBuf,
    counter: AtomicU64,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Workspace root shared by all sessions
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by `session`
    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    /// Write `code` into a fresh request directory for `session`.
    ///
    /// Creates the session directory if absent. The request directory name
    /// combines a process-wide counter with a random suffix.
    #[instrument(skip(self, code, language), fields(language = %language.name))]
    pub async fn materialize(
        &self,
        session: &SessionId,
        code: &str,
        language: &Language,
    ) -> Result<Workspace, WorkspaceError> {
        let source_name = language.source_name();
        validate_file_name(&source_name)?;
        if let Some(artifact) = language.artifact_name() {
            validate_file_name(artifact)?;
        }

        let root_dir = self.session_dir(session);
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let request_dir = root_dir.join(format!("{seq}-{}", &suffix[..8]));

        tokio::fs::create_dir_all(&request_dir)
            .await
            .map_err(|source| WorkspaceError::CreateDir {
                path: request_dir.clone(),
                source,
            })?;

        let workspace = Workspace {
            source_file: request_dir.join(&source_name),
            artifact_file: language.artifact_name().map(|name| request_dir.join(name)),
            root_dir,
            request_dir,
        };

        if let Err(source) = tokio::fs::write(&workspace.source_file, code).await {
            self.cleanup(&workspace).await;
            return Err(WorkspaceError::WriteSource {
                path: workspace.source_file.clone(),
                source,
            });
        }

        debug!(
            path = %workspace.source_file.display(),
            len = code.len(),
            "materialized source"
        );
        Ok(workspace)
    }

    /// Remove the source file, the artifact and the request directory.
    ///
    /// Best effort and idempotent: failures are logged, never returned.
    #[instrument(skip(self, workspace), fields(dir = %workspace.request_dir.display()))]
    pub async fn cleanup(&self, workspace: &Workspace) {
        remove_file(&workspace.source_file).await;
        if let Some(ref artifact) = workspace.artifact_file {
            remove_path(artifact).await;
        }
        // Anything else the toolchain dropped next to the source
        remove_dir(&workspace.request_dir).await;
        debug!("workspace cleaned up");
    }

    /// Remove everything `session` left behind
    #[instrument(skip(self))]
    pub async fn teardown_session(&self, session: &SessionId) {
        remove_dir(&self.session_dir(session)).await;
    }

    /// Remove the whole workspace root
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn purge(&self) {
        remove_dir(&self.root).await;
    }
}

fn validate_file_name(name: &str) -> Result<(), WorkspaceError> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(WorkspaceError::InvalidPath(format!(
            "not a plain file name: {name}"
        )));
    }
    Ok(())
}

async fn remove_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

async fn remove_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove directory"),
    }
}

/// Artifacts may be files or directories (some toolchains emit bundles)
async fn remove_path(path: &Path) {
    match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => remove_dir(path).await,
        Ok(_) => remove_file(path).await,
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to inspect artifact"),
    }
}
