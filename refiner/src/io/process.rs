//! Child processes with a deadline, cooperative cancellation and bounded capture.
//!
//! Used for both `docker` invocations and generator commands. Every pipe is
//! serviced by its own thread so a chatty or stubborn child can never block
//! the wait loop past its deadline. Grandchildren may keep a pipe open after
//! the child is gone; readers then get [`READER_GRACE`] before their partial
//! output is taken as final.

use std::io::{self, Read, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::cancel::CancelToken;

/// How often a waiting child is checked for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// How long pipe readers may lag behind the child's exit or kill.
const READER_GRACE: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 8 * 1024;

/// Bytes kept from one output stream, plus how many were thrown away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Captured {
    pub bytes: Vec<u8>,
    pub dropped: u64,
}

impl Captured {
    /// UTF-8 (lossy) text, with a trailing note when bytes were dropped.
    pub fn lossy(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

/// How a child process ended and what it printed.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Captured,
    pub stderr: Captured,
    /// Killed because the deadline passed.
    pub timed_out: bool,
    /// Killed because the cancel token fired first.
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn stdout_lossy(&self) -> String {
        self.stdout.lossy("stdout")
    }

    pub fn stderr_lossy(&self) -> String {
        self.stderr.lossy("stderr")
    }

    /// Ran to completion and exited 0.
    pub fn success(&self) -> bool {
        !self.timed_out && !self.cancelled && self.status.success()
    }
}

/// Reader thread that keeps at most `limit` bytes and drains the rest.
///
/// Bytes land in `shared` as they arrive, so a reader that never sees EOF
/// still leaves its output behind.
struct Capture {
    shared: Arc<Mutex<Captured>>,
    done: mpsc::Receiver<io::Result<()>>,
}

impl Capture {
    fn spawn<R: Read + Send + 'static>(reader: R, limit: usize) -> Self {
        let shared = Arc::new(Mutex::new(Captured::default()));
        let (tx, done) = mpsc::channel();
        let sink = Arc::clone(&shared);
        thread::spawn(move || {
            // The receiver is gone once `finish` gave up waiting.
            let _ = tx.send(capture_into(reader, limit, &sink));
        });
        Self { shared, done }
    }

    /// Wait up to `grace` for EOF, then take whatever was captured.
    fn finish(self, stream: &str, grace: Duration) -> Result<Captured> {
        match self.done.recv_timeout(grace) {
            Ok(read) => read.with_context(|| format!("read {stream}"))?,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    stream,
                    "pipe still open after the command ended, keeping partial output"
                );
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("{stream} reader thread panicked"));
            }
        }
        let mut captured = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(std::mem::take(&mut *captured))
    }
}

fn capture_into<R: Read>(
    mut reader: R,
    limit: usize,
    shared: &Mutex<Captured>,
) -> io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = match reader.read(&mut chunk) {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        let mut captured = shared.lock().unwrap_or_else(PoisonError::into_inner);
        let keep = n.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += u64::try_from(n - keep).unwrap_or(u64::MAX);
    }
}

/// Writes the whole input and closes the pipe. Failures are logged only: a
/// child may legitimately exit without reading its input.
///
/// The thread is detached; a grandchild holding the pipe may block it
/// indefinitely.
fn feed_stdin(mut pipe: ChildStdin, input: Vec<u8>) {
    thread::spawn(move || {
        if let Err(e) = pipe.write_all(&input) {
            warn!(err = %e, "failed to write stdin");
        }
    });
}

/// Run `cmd` until it exits, `timeout` elapses or `cancel` fires.
///
/// Killed children still report whatever they printed before the kill.
/// Errors only cover spawning and waiting; a non-zero exit is a normal result.
#[instrument(skip_all, fields(program = ?cmd.get_program(), timeout_secs = timeout.as_secs()))]
pub fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    cancel: &CancelToken,
) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped());

    let started = Instant::now();
    let mut child = cmd.spawn().map_err(|e| {
        error!(err = %e, "failed to spawn command");
        anyhow::Error::new(e).context("spawn command")
    })?;
    debug!(pid = child.id(), "child spawned");

    let stdout = Capture::spawn(
        child.stdout.take().context("stdout was not piped")?,
        output_limit_bytes,
    );
    let stderr = Capture::spawn(
        child.stderr.take().context("stderr was not piped")?,
        output_limit_bytes,
    );
    if let Some(input) = stdin {
        feed_stdin(
            child.stdin.take().context("stdin was not piped")?,
            input.to_vec(),
        );
    }

    let (status, timed_out, cancelled) = wait(&mut child, started, timeout, cancel)?;

    let stdout = stdout.finish("stdout", READER_GRACE)?;
    let stderr = stderr.finish("stderr", READER_GRACE)?;
    if stdout.dropped > 0 || stderr.dropped > 0 {
        warn!(
            stdout_dropped = stdout.dropped,
            stderr_dropped = stderr.dropped,
            "output truncated"
        );
    }

    let duration = started.elapsed();
    debug!(
        exit_code = ?status.code(),
        timed_out,
        cancelled,
        elapsed_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        "command finished"
    );
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        timed_out,
        cancelled,
        duration,
    })
}

/// Poll the child in short slices; returns `(status, timed_out, cancelled)`.
fn wait(
    child: &mut Child,
    started: Instant,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<(ExitStatus, bool, bool)> {
    loop {
        let elapsed = started.elapsed();
        if elapsed >= timeout {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            return Ok((kill_and_reap(child)?, true, false));
        }
        if cancel.is_cancelled() {
            warn!("command cancelled, killing");
            return Ok((kill_and_reap(child)?, false, true));
        }
        let slice = POLL_INTERVAL.min(timeout - elapsed);
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            return Ok((status, false, false));
        }
    }
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    // Exiting between the last poll and the kill is fine.
    if let Err(e) = child.kill() {
        debug!(err = %e, "kill after exit");
    }
    child.wait().context("reap killed command")
}
