//! Integration tests for webterm
//!
//! The default suite only needs `/bin/sh`: languages in
//! `fixtures/configs/shell.toml` are shell scripts, with a fake compiler
//! that syntax-checks and copies the source.
//!
//! Tests against real toolchains (node, python3, gcc) are behind a feature
//! and marked `#[ignore]`. To include them:
//!    cargo test -p webterm --features toolchain-tests -- --include-ignored

use std::fs;
use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tokio::sync::mpsc;
use webterm::{
    ChunkKind, Config, Dispatcher, ExecutionRequest, ExecutionResult, ExecutionSession,
    OutputChunk, SessionEvent, SessionId,
};

mod compile_and_run;
mod execution;
mod limits;
mod transport;


pub(crate) const FIXTURES_PATH: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures");

/// Helper to get fixture file content
#[allow(dead_code)]
pub(crate) fn fixture_source(name: &str) -> String {
    let path = format!("{FIXTURES_PATH}/sources/{name}");
    fs::read_to_string(&path).unwrap_or_else(|e| panic!("Failed to read fixture {path}: {e}"))
}

pub(crate) fn fixture_config(name: &str) -> PathBuf {
    Path::new(FIXTURES_PATH).join("configs").join(name)
}

/// A dispatcher whose workspaces live in a private temp root
pub(crate) struct Harness {
    pub dispatcher: Dispatcher,
    pub root: TempDir,
}

impl Harness {
    /// Shell-backed languages from the fixtures
    pub fn new() -> Self {
        let config = Config::from_file(fixture_config("shell.toml")).expect("fixture config");
        Self::with_config(config)
    }

    /// Built-in language table, for toolchain tests
    #[allow(dead_code)]
    pub fn builtin() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(mut config: Config) -> Self {
        let root = tempfile::tempdir().expect("temp root");
        config.workspace_root = root.path().join("workspaces");
        let dispatcher = Dispatcher::new(&config).expect("valid config");
        Self { dispatcher, root }
    }

    pub fn workspace_root(&self) -> &Path {
        self.dispatcher.backend().workspaces.root()
    }

    pub fn session(&self, name: &str) -> (ExecutionSession, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let id = SessionId::new(name).expect("valid session id");
        (self.dispatcher.session(id, name, tx), rx)
    }

    /// Run one request on a fresh session and tear it down
    pub async fn run(&self, request: ExecutionRequest) -> Transcript {
        let (session, rx) = self.session(SessionId::generate().as_str());
        let handle = session.start(request).expect("idle session");
        let transcript = Transcript::collect(rx).await;
        handle.await.expect("execution task");
        session.teardown().await;
        transcript
    }
}

/// Everything a client saw for one request
#[derive(Debug)]
pub(crate) struct Transcript {
    pub chunks: Vec<OutputChunk>,
    pub result: ExecutionResult,
    /// Completions seen, including the terminal one
    pub completions: usize,
}

impl Transcript {
    /// Read events up to and including the completion
    pub async fn collect(mut rx: mpsc::Receiver<SessionEvent>) -> Self {
        let mut chunks = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::Output(chunk) => chunks.push(chunk),
                SessionEvent::Complete(result) => {
                    // Nothing may follow the completion
                    let mut completions = 1;
                    while let Ok(event) = rx.try_recv() {
                        assert!(
                            matches!(event, SessionEvent::Complete(_)),
                            "output after completion: {event:?}"
                        );
                        completions += 1;
                    }
                    return Self {
                        chunks,
                        result,
                        completions,
                    };
                }
            }
        }
        panic!("event channel closed without a completion; saw {chunks:?}");
    }

    pub fn text_of(&self, kinds: &[ChunkKind]) -> String {
        self.chunks
            .iter()
            .filter(|c| kinds.contains(&c.kind))
            .map(|c| c.text.as_str())
            .collect()
    }

    pub fn stdout(&self) -> String {
        self.text_of(&[ChunkKind::Stdout])
    }

    pub fn errors(&self) -> String {
        self.chunks
            .iter()
            .filter(|c| c.is_error())
            .map(|c| c.text.as_str())
            .collect()
    }

    pub fn all_text(&self) -> String {
        self.chunks.iter().map(|c| c.text.as_str()).collect()
    }
}

/// Count every entry below `dir`
pub(crate) fn count_entries(dir: &Path) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .flatten()
        .map(|entry| {
            let path = entry.path();
            if path.is_dir() {
                1 + count_entries(&path)
            } else {
                1
            }
        })
        .sum()
}
