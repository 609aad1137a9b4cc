//! Bounded subprocess runner
//!
//! Starts one external process per call with an explicit argument vector,
//! a finite timeout, and bounded output capture. A shared cancellation
//! flag is polled between wait intervals; on cancellation or timeout the
//! child is terminated, escalating to a hard kill after a grace period.
//!
//! Diagnostics streams can be redirected to temporary files when the
//! caller declares the output may be large, avoiding pipe-buffer deadlock;
//! the temporary files are owned by the call and removed on every exit
//! path.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::time::Instant;

/// How often the wait loop re-checks cancellation and the deadline.
pub const SUBPROCESS_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Grace period between terminating a child and re-issuing the kill.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Cap on in-memory captured output per stream.
const MEMORY_CAPTURE_CAP: usize = 1024 * 1024;

/// Cap on output read back from a temporary capture file.
const FILE_CAPTURE_CAP: usize = 4 * 1024 * 1024;

/// Fixed timeout for video probe and decode invocations.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(60);

const EXTRACTION_MIN: Duration = Duration::from_secs(5 * 60);
const EXTRACTION_CAP: Duration = Duration::from_secs(2 * 3600);
const EXTRACTION_RATE_BYTES_PER_SEC: f64 = 10.0 * 1024.0 * 1024.0;
const EXTRACTION_BUFFER: f64 = 1.5;

const PARITY_MIN: Duration = Duration::from_secs(10 * 60);
const PARITY_CAP: Duration = Duration::from_secs(3 * 3600);
const PARITY_RATE_BYTES_PER_SEC: f64 = 5.0 * 1024.0 * 1024.0;
const PARITY_BUFFER: f64 = 2.0;

/// Dynamic timeout for archive extraction, derived from the archive set
/// size at a conservative drive speed.
pub fn extraction_timeout(size_bytes: u64) -> Duration {
    dynamic_timeout(
        size_bytes,
        EXTRACTION_RATE_BYTES_PER_SEC,
        EXTRACTION_BUFFER,
        EXTRACTION_MIN,
        EXTRACTION_CAP,
    )
}

/// Dynamic timeout for parity repair. Parity is slower than extraction
/// because of checksum verification, so it gets a larger buffer.
pub fn parity_timeout(size_bytes: u64) -> Duration {
    dynamic_timeout(
        size_bytes,
        PARITY_RATE_BYTES_PER_SEC,
        PARITY_BUFFER,
        PARITY_MIN,
        PARITY_CAP,
    )
}

fn dynamic_timeout(
    size_bytes: u64,
    rate_bytes_per_sec: f64,
    buffer: f64,
    min: Duration,
    cap: Duration,
) -> Duration {
    if size_bytes == 0 {
        return min;
    }
    let expected_secs = size_bytes as f64 / rate_bytes_per_sec;
    let timeout = Duration::from_secs_f64(expected_secs * buffer);
    timeout.clamp(min, cap)
}

/// Run-global cancellation flag, set once by the signal handler.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Wall-clock budget for the whole run.
#[derive(Debug, Clone)]
pub struct RunBudget {
    started: Instant,
    limit: Duration,
}

impl RunBudget {
    pub fn new(limit: Duration) -> Self {
        Self {
            started: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.started.elapsed())
    }

    pub fn exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Clamp a wanted timeout to the remaining budget. `None` means the
    /// budget is exhausted and the operation must not start.
    pub fn clamp(&self, wanted: Duration) -> Option<Duration> {
        let remaining = self.remaining();
        if remaining.is_zero() {
            None
        } else {
            Some(wanted.min(remaining))
        }
    }
}

/// Where a child's diagnostics streams are captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureMode {
    /// Piped capture with an in-memory cap. For small, predictable output.
    Memory,
    /// Redirect to temporary files. For output that may be large
    /// (archive listings, extraction logs).
    TempFile,
}

/// One subprocess invocation: explicit argument vector, never a shell
/// string.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub capture: CaptureMode,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
            capture: CaptureMode::Memory,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn capture(mut self, mode: CaptureMode) -> Self {
        self.capture = mode;
        self
    }
}

/// Captured result of a completed child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Both streams joined, for keyword scanning.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

/// Outcome of one runner call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(ProcessOutput),
    TimedOut { waited: Duration },
    Cancelled,
}

/// Error type for runner operations
#[derive(Debug, Error)]
pub enum RunnerError {
    /// The binary could not be started at all.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// IO error while waiting on or reading from the child.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The global runtime budget is exhausted; no new subprocess may start.
    #[error("Global runtime budget exhausted")]
    BudgetExhausted,
}

/// Subprocess runner bound to the run's cancellation flag and budget.
#[derive(Debug, Clone)]
pub struct Runner {
    cancel: CancelFlag,
    budget: RunBudget,
}

impl Runner {
    pub fn new(cancel: CancelFlag, budget: RunBudget) -> Self {
        Self { cancel, budget }
    }

    pub fn cancel_flag(&self) -> &CancelFlag {
        &self.cancel
    }

    pub fn budget(&self) -> &RunBudget {
        &self.budget
    }

    /// Run one external process to completion, timeout, or cancellation.
    pub async fn run(&self, spec: CommandSpec) -> Result<RunOutcome, RunnerError> {
        // A zero or missing timeout is a programmer error, not a runtime
        // condition.
        assert!(
            !spec.timeout.is_zero(),
            "subprocess timeout must be finite and non-zero"
        );

        let effective_timeout = self
            .budget
            .clamp(spec.timeout)
            .ok_or(RunnerError::BudgetExhausted)?;

        if self.cancel.is_cancelled() {
            return Ok(RunOutcome::Cancelled);
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        match spec.capture {
            CaptureMode::Memory => self.run_piped(command, &spec, effective_timeout).await,
            CaptureMode::TempFile => self.run_tempfile(command, &spec, effective_timeout).await,
        }
    }

    async fn run_piped(
        &self,
        mut command: Command,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<RunOutcome, RunnerError> {
        command.stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task =
            tokio::spawn(
                async move { read_capped(stdout, MEMORY_CAPTURE_CAP).await },
            );
        let stderr_task =
            tokio::spawn(
                async move { read_capped(stderr, MEMORY_CAPTURE_CAP).await },
            );

        match self.wait_bounded(&mut child, timeout).await? {
            WaitResult::Exited(status) => {
                let stdout = stdout_task.await.unwrap_or_default();
                let stderr = stderr_task.await.unwrap_or_default();
                Ok(RunOutcome::Completed(ProcessOutput {
                    exit_code: status,
                    stdout,
                    stderr,
                }))
            }
            WaitResult::TimedOut(waited) => {
                stdout_task.abort();
                stderr_task.abort();
                Ok(RunOutcome::TimedOut { waited })
            }
            WaitResult::Cancelled => {
                stdout_task.abort();
                stderr_task.abort();
                Ok(RunOutcome::Cancelled)
            }
        }
    }

    async fn run_tempfile(
        &self,
        mut command: Command,
        spec: &CommandSpec,
        timeout: Duration,
    ) -> Result<RunOutcome, RunnerError> {
        // The temp files are owned by this call; dropping them unlinks
        // them on every exit path.
        let stdout_file = tempfile::NamedTempFile::new()?;
        let stderr_file = tempfile::NamedTempFile::new()?;

        command
            .stdout(Stdio::from(stdout_file.reopen()?))
            .stderr(Stdio::from(stderr_file.reopen()?));

        let mut child = command.spawn().map_err(|source| RunnerError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        match self.wait_bounded(&mut child, timeout).await? {
            WaitResult::Exited(status) => Ok(RunOutcome::Completed(ProcessOutput {
                exit_code: status,
                stdout: read_file_capped(stdout_file.path()),
                stderr: read_file_capped(stderr_file.path()),
            })),
            WaitResult::TimedOut(waited) => Ok(RunOutcome::TimedOut { waited }),
            WaitResult::Cancelled => Ok(RunOutcome::Cancelled),
        }
    }

    /// Wait for the child, polling cancellation between bounded waits.
    async fn wait_bounded(
        &self,
        child: &mut Child,
        timeout: Duration,
    ) -> Result<WaitResult, RunnerError> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            match tokio::time::timeout(SUBPROCESS_POLL_INTERVAL, child.wait()).await {
                Ok(status) => {
                    let status = status?;
                    return Ok(WaitResult::Exited(status.code()));
                }
                Err(_) => {
                    if self.cancel.is_cancelled() {
                        terminate(child).await;
                        return Ok(WaitResult::Cancelled);
                    }
                    if Instant::now() >= deadline {
                        terminate(child).await;
                        return Ok(WaitResult::TimedOut(started.elapsed()));
                    }
                }
            }
        }
    }
}

enum WaitResult {
    Exited(Option<i32>),
    TimedOut(Duration),
    Cancelled,
}

/// Terminate a child, escalating to a second kill after the grace period.
async fn terminate(child: &mut Child) {
    let _ = child.start_kill();
    if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

async fn read_capped<R>(reader: Option<R>, cap: usize) -> String
where
    R: tokio::io::AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return String::new();
    };

    let mut collected = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if collected.len() < cap {
                    let take = (cap - collected.len()).min(n);
                    collected.extend_from_slice(&chunk[..take]);
                }
                // Keep draining past the cap so the child never blocks on
                // a full pipe.
            }
        }
    }
    String::from_utf8_lossy(&collected).into_owned()
}

fn read_file_capped(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(mut bytes) => {
            bytes.truncate(FILE_CAPTURE_CAP);
            String::from_utf8_lossy(&bytes).into_owned()
        }
        Err(_) => String::new(),
    }
}
