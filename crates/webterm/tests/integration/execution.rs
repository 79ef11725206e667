use webterm::{ChunkKind, ExecutionRequest, Outcome, Preferences};

use super::Harness;

#[tokio::test]
async fn test_run_hello_world() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo 'Hello, World!'", "shell"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.result.exit_code, Some(0));
    assert_eq!(transcript.result.language, "shell");
    assert_eq!(transcript.stdout(), "Hello, World!\n");
    assert_eq!(transcript.completions, 1);
}

#[tokio::test]
async fn test_progress_notices_precede_output() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo out", "shell"))
        .await;

    let notices = transcript.text_of(&[ChunkKind::Notice]);
    assert!(notices.contains("[webterm] Executing shell code..."));
    assert!(notices.contains("Code file created successfully."));
    assert!(notices.contains("Running shell code..."));

    let first_stdout = transcript
        .chunks
        .iter()
        .position(|c| c.kind == ChunkKind::Stdout)
        .unwrap();
    assert!(
        transcript.chunks[..first_stdout]
            .iter()
            .all(|c| c.kind == ChunkKind::Notice)
    );
}

#[tokio::test]
async fn test_progress_can_be_turned_off() {
    let harness = Harness::new();
    let (session, rx) = harness.session("quiet");
    session.preferences().set(Preferences {
        show_progress: false,
    });

    let handle = session
        .start(ExecutionRequest::new("echo only-this", "shell"))
        .unwrap();
    let transcript = super::Transcript::collect(rx).await;
    handle.await.unwrap();

    assert_eq!(transcript.chunks.len(), 1);
    assert_eq!(transcript.stdout(), "only-this\n");
}

#[tokio::test]
async fn test_stderr_is_flagged_as_error() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo fine; echo broken >&2", "shell"))
        .await;

    // Exit code 0 with stderr is still a success
    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.stdout(), "fine\n");
    assert_eq!(transcript.text_of(&[ChunkKind::Stderr]), "broken\n");
    assert!(transcript.errors().contains("broken"));
}

#[tokio::test]
async fn test_nonzero_exit_is_runtime_error() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo bad input >&2; exit 3", "shell"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::RuntimeError);
    assert_eq!(transcript.result.exit_code, Some(3));
    assert_eq!(transcript.result.stderr, "bad input\n");
    assert!(transcript.errors().contains("Process exited with code 3"));
}

#[tokio::test]
async fn test_killed_by_signal_is_runtime_error() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("kill -TERM $$", "shell"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::RuntimeError);
    assert_eq!(transcript.result.exit_code, None);
    assert_eq!(transcript.result.signal, Some(15));
    assert!(transcript.errors().contains("killed by signal 15"));
}

#[tokio::test]
async fn test_unknown_language_falls_back() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo fell back", "brainfuck"))
        .await;

    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.result.language, "shell");
    assert_eq!(transcript.stdout(), "fell back\n");

    let first = &transcript.chunks[0];
    assert!(first.is_error());
    assert_eq!(
        first.text,
        "Language brainfuck is not supported, using shell instead.\r\n"
    );
}

#[tokio::test]
async fn test_language_lookup_ignores_case() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("echo ok", "  SHELL "))
        .await;

    assert_eq!(transcript.result.language, "shell");
    assert!(!transcript.all_text().contains("not supported"));
}

#[tokio::test]
async fn test_utf8_output_survives() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("printf 'h\\303\\251llo \\342\\234\\223\\n'", "shell"))
        .await;

    assert_eq!(transcript.stdout(), "héllo ✓\n");
}

#[tokio::test]
async fn test_source_is_written_verbatim() {
    let harness = Harness::new();
    let code = r#"cat "$0" # it's "quoted" \ $(not run) `nor this`"#;

    let transcript = harness.run(ExecutionRequest::new(code, "shell")).await;

    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert_eq!(transcript.stdout(), code);
}

#[tokio::test]
async fn test_host_environment_is_not_inherited() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new(
            "echo \"home=${HOME:-unset} cargo=${CARGO_MANIFEST_DIR:-unset}\"",
            "shell",
        ))
        .await;

    // Only PATH is allow-listed in the fixture config
    assert_eq!(transcript.stdout(), "home=unset cargo=unset\n");
}
