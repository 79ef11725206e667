use std::time::{Duration, Instant};

use webterm::{ExecutionLimits, ExecutionRequest, Outcome};

use super::Harness;

#[tokio::test]
async fn test_infinite_loop_times_out() {
    let harness = Harness::new();
    let request = ExecutionRequest::new("echo start; while :; do :; done", "shell")
        .with_limits(ExecutionLimits::unset().with_timeout_ms(500));

    let started = Instant::now();
    let transcript = harness.run(request).await;

    assert_eq!(transcript.result.outcome, Outcome::Timeout);
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(transcript.stdout(), "start\n");
    assert!(
        transcript
            .errors()
            .contains("Execution timed out after 500 ms")
    );
}

#[tokio::test]
async fn test_timeout_kills_background_children() {
    let harness = Harness::new();
    let pid_file = harness.root.path().join("child.pid");
    let code = format!(
        "sleep 60 &\necho $! > {}\nwait\n",
        pid_file.display()
    );
    let request = ExecutionRequest::new(code, "shell")
        .with_limits(ExecutionLimits::unset().with_timeout_ms(500));

    let transcript = harness.run(request).await;
    assert_eq!(transcript.result.outcome, Outcome::Timeout);

    let pid: i32 = std::fs::read_to_string(&pid_file)
        .unwrap()
        .trim()
        .parse()
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while is_running(pid) && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!is_running(pid), "background child {pid} survived the timeout");
}

#[tokio::test]
async fn test_output_is_truncated_at_ceiling() {
    let harness = Harness::new();
    let request = ExecutionRequest::new(
        "i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done",
        "shell",
    )
    .with_limits(ExecutionLimits::unset().with_max_output_bytes(1000));

    let transcript = harness.run(request).await;

    assert!(transcript.result.truncated);
    assert_eq!(transcript.result.outcome, Outcome::Success);
    assert!(transcript.stdout().len() <= 1000);

    let notices = transcript
        .chunks
        .iter()
        .filter(|c| c.text.contains("[output truncated after 1000 bytes]"))
        .count();
    assert_eq!(notices, 1);
}

#[tokio::test]
async fn test_truncation_keeps_whole_characters() {
    let harness = Harness::new();
    let request = ExecutionRequest::new(
        "printf a; i=0; while [ $i -lt 1000 ]; do printf '\u{e9}'; i=$((i+1)); done",
        "shell",
    )
    .with_limits(ExecutionLimits::unset().with_max_output_bytes(1000));

    let transcript = harness.run(request).await;
    let stdout = transcript.stdout();

    assert!(transcript.result.truncated);
    assert!(stdout.len() <= 1000);
    assert!(stdout.starts_with("a\u{e9}"));
    assert!(!stdout.contains(char::REPLACEMENT_CHARACTER));
}

#[tokio::test]
async fn test_output_under_ceiling_is_complete() {
    let harness = Harness::new();
    let transcript = harness
        .run(ExecutionRequest::new("seq 1 100", "shell"))
        .await;

    assert!(!transcript.result.truncated);
    let expected: String = (1..=100).map(|i| format!("{i}\n")).collect();
    assert_eq!(transcript.stdout(), expected);
}

/// Alive and not a zombie waiting to be reaped
fn is_running(pid: i32) -> bool {
    if nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_err() {
        return false;
    }
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // State is the first field after the parenthesised command name
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.split_whitespace().next())
            .is_some_and(|state| state != "Z"),
        Err(_) => false,
    }
}
