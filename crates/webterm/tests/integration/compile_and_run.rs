use std::time::{Duration, Instant};

use webterm::{ChunkKind, Config, ExecutionLimits, ExecutionRequest, Outcome, SessionState};

use super::{Harness, Transcript, count_entries, fixture_config};

/// Shell fixture whose `shellc` compiler hangs
fn hanging_compiler() -> Harness {
    let mut config = Config::from_file(fixture_config("shell.toml")).unwrap();
    let compile = config
        .languages
        .get_mut("shellc")
        .unwrap()
        .compile
        .as_mut()
        .unwrap();
    compile.command = vec!["sh".into(), "-c".into(), "sleep 30".into()];
    Harness::with_config(config)
}

#[tokio::test]
async fn test_compile_then_run() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo compiled ok", "shellc"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.stdout(), "compiled ok\n");

    let notices = transcript.text_of(&[ChunkKind::Notice]);
    assert!(notices.contains("Compiling shellc code..."));
    assert!(notices.contains("Compilation successful. Running code..."));
    assert!(!notices.contains("Running shellc code..."));
}

#[tokio::test]
async fn test_compile_error_skips_run() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo never; if then fi (", "shellc"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::CompileError);
    assert_eq!(transcript.result.exit_code, None);
    assert!(transcript.stdout().is_empty());

    let diagnostic = transcript.result.diagnostic.as_deref().unwrap();
    assert!(!diagnostic.is_empty());
    assert!(transcript.errors().contains("Compilation error: "));
    assert!(!transcript.all_text().contains("Compilation successful"));
    assert_eq!(transcript.completions, 1);
}

#[tokio::test]
async fn test_compile_warnings_do_not_fail_when_allowed() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo ran anyway", "noisy"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.stdout(), "ran anyway\n");

    let warning = transcript
        .chunks
        .iter()
        .find(|c| c.text.starts_with("Warnings: "))
        .unwrap();
    assert!(!warning.is_error());
    assert!(warning.text.contains("unused variable"));
}

#[tokio::test]
async fn test_compile_warnings_fail_by_default() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo should not run", "strict"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::CompileError);
    assert!(
        transcript
            .result
            .diagnostic
            .as_deref()
            .unwrap()
            .contains("implicit declaration")
    );
    assert!(transcript.stdout().is_empty());
}

#[tokio::test]
async fn test_runtime_error_after_compile() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo partial; exit 2", "shellc"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::RuntimeError);
    assert_eq!(transcript.result.exit_code, Some(2));
    assert_eq!(transcript.stdout(), "partial\n");
}

#[tokio::test]
async fn test_compile_timeout() {
    let harness = hanging_compiler();
    let started = Instant::now();
    let transcript = harness
        .run(
            ExecutionRequest::new("echo never", "shellc")
                .with_limits(ExecutionLimits::unset().with_timeout_ms(300)),
        )
        .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transcript.result.outcome, Outcome::Timeout);
    assert!(transcript.stdout().is_empty());
    assert!(transcript.errors().contains("Execution timed out after 300 ms"));
    assert!(!transcript.all_text().contains("Compilation successful"));
    assert_eq!(transcript.completions, 1);
    assert_eq!(count_entries(harness.workspace_root()), 0);
}

#[tokio::test]
async fn test_cancel_while_compiling() {
    let harness = hanging_compiler();
    let (session, rx) = harness.session("compiling");

    let handle = session
        .start(ExecutionRequest::new("echo never", "shellc"))
        .unwrap();
    let collector = tokio::spawn(Transcript::collect(rx));

    let deadline = Instant::now() + Duration::from_secs(5);
    while session.state() != SessionState::Compiling && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(session.state(), SessionState::Compiling);
    let started = Instant::now();
    assert!(session.cancel());

    let result = handle.await.unwrap();
    let transcript = collector.await.unwrap();
    session.teardown().await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(result.outcome, Outcome::Cancelled);
    assert_eq!(transcript.result.outcome, Outcome::Cancelled);
    assert!(transcript.errors().contains("Execution cancelled"));
    assert!(!transcript.all_text().contains("Compilation successful"));
    assert_eq!(transcript.completions, 1);
    assert_eq!(count_entries(harness.workspace_root()), 0);
}
