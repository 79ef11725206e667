//! Supervised external processes
//!
//! Spawns one command, streams its output, and enforces the wall-clock
//! timeout and per-stream output ceiling. The child runs in its own process
//! group, which is killed as a whole on timeout, on cancellation and after a
//! normal exit so no grandchildren outlive the request.

use std::os::unix::process::ExitStatusExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{Signal, killpg};
use nix::sys::wait::{Id, WaitPidFlag, waitid};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub use crate::process::command::{ProcessCommand, resolve_command};
use crate::types::{ChunkKind, OutputChunk};

mod command;

const READ_BUF_SIZE: usize = 8 * 1024;

/// How long to wait for the output pipes to drain after the group is killed
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Errors that prevent a process from running at all
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("empty command")]
    EmptyCommand,

    #[error("command '{0}' not found in PATH")]
    CommandNotFound(String),

    #[error("failed to spawn process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What a finished (or killed) process left behind
#[derive(Debug, Clone, Default)]
pub struct ProcessOutput {
    /// Captured stdout, at most `max_output_bytes` long
    pub stdout: String,

    /// Captured stderr, at most `max_output_bytes` long
    pub stderr: String,

    /// Exit code if the process exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the process was killed by a signal
    pub signal: Option<i32>,

    /// Killed because the wall-clock budget ran out
    pub timed_out: bool,

    /// Killed on request
    pub cancelled: bool,

    /// Either stream hit the output ceiling
    pub truncated: bool,

    /// Wall-clock time from spawn to exit
    pub duration: Duration,
}

impl ProcessOutput {
    /// Exited on its own with code 0
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.exit_code == Some(0)
    }

    pub fn duration_ms(&self) -> u64 {
        u64::try_from(self.duration.as_millis()).unwrap_or(u64::MAX)
    }
}

enum Exit {
    /// `None` when the leader exited but is left for `child.wait()` to reap
    Exited(Option<std::io::Result<std::process::ExitStatus>>),
    TimedOut,
    Cancelled,
}

/// Run `command` to completion.
///
/// Output is forwarded to `sink` as it is produced when one is given.
/// Returns `Err` only when the process could not be started; timeouts and
/// cancellation are reported through [`ProcessOutput`].
#[instrument(skip_all, fields(program = %command.program()))]
pub async fn run(
    command: &ProcessCommand,
    cancel: &CancellationToken,
    sink: Option<&mpsc::Sender<OutputChunk>>,
) -> Result<ProcessOutput, ProcessError> {
    if cancel.is_cancelled() {
        return Ok(ProcessOutput {
            cancelled: true,
            ..Default::default()
        });
    }

    let mut cmd = command.build()?;
    debug!(args = ?command.args(), "spawning process");

    let start = Instant::now();
    let mut child = cmd.spawn().map_err(ProcessError::SpawnFailed)?;
    let pid = child.id();

    let limit = command.get_limits().max_output();
    let stdout = Capture::spawn(child.stdout.take(), ChunkKind::Stdout, limit, sink.cloned());
    let stderr = Capture::spawn(child.stderr.take(), ChunkKind::Stderr, limit, sink.cloned());

    let exit = tokio::select! {
        reaped = leader_exit(&mut child, pid) => Exit::Exited(reaped),
        () = tokio::time::sleep(command.get_limits().timeout()) => Exit::TimedOut,
        () = cancel.cancelled() => Exit::Cancelled,
    };

    // Unless the fallback reaped it, the leader is still a zombie here and its
    // pid cannot name an unrelated group yet.
    kill_process_group(pid);

    let (status, timed_out, cancelled) = match exit {
        Exit::Exited(Some(status)) => (status?, false, false),
        Exit::Exited(None) => (child.wait().await?, false, false),
        Exit::TimedOut => (child.wait().await?, true, false),
        Exit::Cancelled => (child.wait().await?, false, true),
    };
    let duration = start.elapsed();

    let (stdout, stdout_truncated) = stdout.finish().await;
    let (stderr, stderr_truncated) = stderr.finish().await;

    let output = ProcessOutput {
        stdout,
        stderr,
        exit_code: status.code(),
        signal: status.signal(),
        timed_out,
        cancelled,
        truncated: stdout_truncated || stderr_truncated,
        duration,
    };

    debug!(
        exit_code = ?output.exit_code,
        signal = ?output.signal,
        timed_out,
        cancelled,
        truncated = output.truncated,
        duration_ms = output.duration_ms(),
        "process finished"
    );

    Ok(output)
}

/// Wait for the group leader to exit.
///
/// Resolves to `None` once the leader is a zombie that has not been reaped.
/// Only when that cannot be observed does it fall back to reaping, and the
/// status is returned.
async fn leader_exit(
    child: &mut Child,
    pid: Option<u32>,
) -> Option<std::io::Result<std::process::ExitStatus>> {
    if let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) {
        let observed = tokio::task::spawn_blocking(move || wait_unreaped(pid)).await;
        if matches!(observed, Ok(true)) {
            return None;
        }
    }
    Some(child.wait().await)
}

/// Block until `pid` exits, leaving it for a later `wait` to reap
fn wait_unreaped(pid: i32) -> bool {
    loop {
        match waitid(
            Id::Pid(Pid::from_raw(pid)),
            WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT,
        ) {
            Ok(_) => return true,
            Err(Errno::EINTR) => continue,
            Err(e) => {
                debug!(pid, error = %e, "waitid failed, falling back to wait");
                return false;
            }
        }
    }
}

/// SIGKILL every process in the group led by `pid`
fn kill_process_group(pid: Option<u32>) {
    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        // Group already gone
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to kill process group"),
    }
}

#[derive(Debug, Default)]
struct Captured {
    text: String,
    truncated: bool,
}

/// Reader task for one output stream
struct Capture {
    state: Arc<Mutex<Captured>>,
    task: Option<JoinHandle<()>>,
}

impl Capture {
    fn spawn<R>(
        reader: Option<R>,
        kind: ChunkKind,
        limit: usize,
        sink: Option<mpsc::Sender<OutputChunk>>,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let state = Arc::new(Mutex::new(Captured::default()));
        let task = reader.map(|reader| {
            let state = Arc::clone(&state);
            tokio::spawn(read_stream(reader, kind, limit, sink, state))
        });
        Self { state, task }
    }

    /// Wait for the stream to drain and return what was captured
    async fn finish(self) -> (String, bool) {
        if let Some(mut task) = self.task
            && tokio::time::timeout(DRAIN_GRACE, &mut task).await.is_err()
        {
            // Something outside the process group still holds the pipe
            warn!("output stream did not close, abandoning reader");
            task.abort();
        }
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        (std::mem::take(&mut state.text), state.truncated)
    }
}

async fn read_stream<R>(
    mut reader: R,
    kind: ChunkKind,
    limit: usize,
    sink: Option<mpsc::Sender<OutputChunk>>,
    state: Arc<Mutex<Captured>>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut decoder = Utf8Decoder::default();
    let mut kept = 0usize;
    let mut truncated = false;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(error = %e, "output stream read failed");
                break;
            }
        };

        // Past the ceiling the stream is still drained so the child never
        // blocks on a full pipe, but nothing more is kept.
        if truncated {
            continue;
        }
        let text = decoder.decode(&buf[..n]);
        if keep(&state, &sink, kind, text, &mut kept, limit).await {
            truncated = true;
            mark_truncated(&state, &sink, limit).await;
        }
    }

    if !truncated {
        let tail = decoder.finish();
        if keep(&state, &sink, kind, tail, &mut kept, limit).await {
            mark_truncated(&state, &sink, limit).await;
        }
    }
}

/// Publish as much of `text` as fits under `limit`, cutting on a character
/// boundary. Returns `true` when something had to be cut.
async fn keep(
    state: &Mutex<Captured>,
    sink: &Option<mpsc::Sender<OutputChunk>>,
    kind: ChunkKind,
    mut text: String,
    kept: &mut usize,
    limit: usize,
) -> bool {
    let room = limit.saturating_sub(*kept);
    let cut = text.len() > room;
    if cut {
        let mut end = room;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    *kept += text.len();
    publish(state, sink, kind, text).await;
    cut
}

async fn publish(
    state: &Mutex<Captured>,
    sink: &Option<mpsc::Sender<OutputChunk>>,
    kind: ChunkKind,
    text: String,
) {
    if text.is_empty() {
        return;
    }
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .text
        .push_str(&text);
    if let Some(sink) = sink {
        let chunk = OutputChunk { kind, text };
        // A closed sink only means nobody is listening any more
        let _ = sink.send(chunk).await;
    }
}

/// Flag the stream as truncated and tell the listener
async fn mark_truncated(
    state: &Mutex<Captured>,
    sink: &Option<mpsc::Sender<OutputChunk>>,
    limit: usize,
) {
    state
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .truncated = true;
    if let Some(sink) = sink {
        let notice = format!("\r\n[output truncated after {limit} bytes]\r\n");
        let _ = sink.send(OutputChunk::notice(notice)).await;
    }
}

/// Incremental UTF-8 decoder.
///
/// Multi-byte characters split across reads are carried over to the next
/// call; invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::with_capacity(self.pending.len());

        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }

        out
    }

    /// Flush whatever is left, lossily
    pub(crate) fn finish(&mut self) -> String {
        let out = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        out
    }
}
