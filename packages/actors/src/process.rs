//! Child process supervision.
//!
//! [`ProcessSupervisor::spawn`] starts one job process with piped output,
//! streams every line to a sink as it is read, and hands back a
//! [`RunningProcess`] whose [`CancelHandle`] can terminate it. A waiter task
//! owns the child, so signals are only ever sent to a process that has not
//! been reaped yet.

use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dispatch_core::{LineStamper, LogLine, LogStream, truncate_utf8};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

/// Receives every stamped output line of a process.
pub type LogSink = mpsc::UnboundedSender<LogLine>;

/// What to run and how to treat it.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub work_dir: Option<PathBuf>,
    /// Time between SIGTERM and SIGKILL, also the bound on draining output
    /// after exit.
    pub cancel_grace: Duration,
    /// Bytes of stderr retained for the failure report.
    pub stderr_capture_limit: usize,
}

impl ProcessSpec {
    /// Build a spec from a full argument vector; the first element is the
    /// program.
    pub fn from_argv(argv: Vec<String>) -> Result<Self, SpawnError> {
        let mut argv = argv.into_iter();
        let program = argv.next().ok_or(SpawnError::EmptyCommand)?;
        Ok(Self {
            program,
            args: argv.collect(),
            work_dir: None,
            cancel_grace: Duration::from_secs(5),
            stderr_capture_limit: 1024 * 1024,
        })
    }

    pub fn with_work_dir(mut self, dir: Option<impl Into<PathBuf>>) -> Self {
        self.work_dir = dir.map(Into::into);
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_stderr_capture_limit(mut self, limit: usize) -> Self {
        self.stderr_capture_limit = limit;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("empty command")]
    EmptyCommand,

    #[error("executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("permission denied executing {0}")]
    PermissionDenied(String),

    #[error("invalid working directory: {}", .0.display())]
    InvalidWorkDir(PathBuf),

    #[error("spawn failed: {0}")]
    Io(#[from] io::Error),
}

impl SpawnError {
    fn from_io(program: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => SpawnError::ExecutableNotFound(program.to_string()),
            io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied(program.to_string()),
            _ => SpawnError::Io(err),
        }
    }
}

/// A clean exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub exit_code: i32,
    pub completed_at: DateTime<Utc>,
}

/// Nonzero exit, death by signal, or any exit after a cancel request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}", self.summary())]
pub struct ProcessFailure {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Captured stderr, verbatim up to the capture limit.
    pub stderr: String,
    /// A cancel was requested before the exit was observed.
    pub cancelled: bool,
}

impl ProcessFailure {
    fn summary(&self) -> String {
        match self.exit_code {
            Some(code) => format!("process exited with code {}", code),
            None => "process terminated by signal".to_string(),
        }
    }

    /// Human readable failure reason of at most `max_bytes` bytes: the
    /// captured stderr, or the exit summary when stderr was empty.
    pub fn reason(&self, max_bytes: usize) -> String {
        let stderr = self.stderr.trim_end();
        if stderr.is_empty() {
            return self.summary();
        }
        truncate_utf8(stderr, max_bytes).to_string()
    }
}

/// Either side of [`ProcessSupervisor::run`].
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error(transparent)]
    Failed(#[from] ProcessFailure),
}

#[derive(Debug, Default)]
struct Outcome {
    settled: bool,
    cancel_requested: bool,
}

/// State shared by a waiter task and the cancel handles of its process.
#[derive(Debug, Default)]
struct Shared {
    outcome: Mutex<Outcome>,
    cancel: Notify,
}

impl Shared {
    fn outcome(&self) -> MutexGuard<'_, Outcome> {
        self.outcome.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the exit; returns whether a cancel came first.
    fn settle(&self) -> bool {
        let mut outcome = self.outcome();
        outcome.settled = true;
        outcome.cancel_requested
    }
}

/// Capability to terminate exactly one process.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pid: u32,
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Request termination. Returns `true` only for the call that initiated
    /// it; later calls and calls after the process exited do nothing.
    pub fn cancel(&self) -> bool {
        {
            let mut outcome = self.shared.outcome();
            if outcome.settled || outcome.cancel_requested {
                return false;
            }
            outcome.cancel_requested = true;
        }
        tracing::info!("Cancel requested for process {}", self.pid);
        self.shared.cancel.notify_one();
        true
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.shared.outcome().cancel_requested
    }

    /// Whether the exit has been observed.
    pub fn is_settled(&self) -> bool {
        self.shared.outcome().settled
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Whether both handles control the same spawned process.
    pub fn same_process(&self, other: &CancelHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

/// A spawned process whose exit has not been collected yet.
#[derive(Debug)]
pub struct RunningProcess {
    pid: u32,
    handle: CancelHandle,
    done: oneshot::Receiver<Result<Completion, ProcessFailure>>,
}

impl RunningProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.handle.clone()
    }

    /// Wait for the exit and for the output readers to finish.
    pub async fn wait(self) -> Result<Completion, ProcessFailure> {
        match self.done.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProcessFailure {
                exit_code: None,
                stderr: String::new(),
                cancelled: self.handle.is_cancel_requested(),
            }),
        }
    }
}

/// Bounded stderr accumulator shared with its reader task.
#[derive(Debug)]
struct Capture {
    text: Mutex<String>,
    limit: usize,
}

impl Capture {
    fn new(limit: usize) -> Self {
        Self {
            text: Mutex::new(String::new()),
            limit,
        }
    }

    fn push(&self, chunk: &str) {
        let mut text = self.text.lock().unwrap_or_else(PoisonError::into_inner);
        let room = self.limit.saturating_sub(text.len());
        if room > 0 {
            text.push_str(truncate_utf8(chunk, room));
        }
    }

    fn take(&self) -> String {
        std::mem::take(&mut *self.text.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Spawns and supervises job processes.
pub struct ProcessSupervisor;

impl ProcessSupervisor {
    /// Start a process. Output lines go to `sink` as they are read.
    pub fn spawn(spec: ProcessSpec, sink: LogSink) -> Result<RunningProcess, SpawnError> {
        if let Some(dir) = &spec.work_dir
            && !dir.is_dir()
        {
            return Err(SpawnError::InvalidWorkDir(dir.clone()));
        }

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.work_dir {
            cmd.current_dir(dir);
        }
        // Own process group so a cancel reaches every descendant.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| SpawnError::from_io(&spec.program, e))?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Io(io::Error::other("process exited before its pid was read")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Io(io::Error::other("stdout not piped")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SpawnError::Io(io::Error::other("stderr not piped")))?;

        tracing::debug!("Spawned {} {:?} as pid {}", spec.program, spec.args, pid);

        let stamper = Arc::new(LineStamper::new());
        let capture = Arc::new(Capture::new(spec.stderr_capture_limit));
        let readers = [
            tokio::spawn(read_lines(stdout, LogStream::Stdout, stamper.clone(), sink.clone(), None)),
            tokio::spawn(read_lines(
                stderr,
                LogStream::Stderr,
                stamper,
                sink,
                Some(capture.clone()),
            )),
        ];

        let shared = Arc::new(Shared::default());
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(supervise(
            child,
            pid,
            shared.clone(),
            spec.cancel_grace,
            readers,
            capture,
            done_tx,
        ));

        Ok(RunningProcess {
            pid,
            handle: CancelHandle { pid, shared },
            done: done_rx,
        })
    }

    /// Spawn, publish `(pid, handle)` through `on_spawn`, then wait.
    pub async fn run<F>(spec: ProcessSpec, sink: LogSink, on_spawn: F) -> Result<Completion, ProcessError>
    where
        F: FnOnce(u32, CancelHandle),
    {
        let process = Self::spawn(spec, sink)?;
        on_spawn(process.pid(), process.cancel_handle());
        Ok(process.wait().await?)
    }
}

async fn read_lines<R>(
    reader: R,
    stream: LogStream,
    stamper: Arc<LineStamper>,
    sink: LogSink,
    capture: Option<Arc<Capture>>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let raw = String::from_utf8_lossy(&buf);
                if let Some(capture) = &capture {
                    capture.push(&raw);
                }
                let text = raw.trim_end_matches(['\n', '\r']);
                // A dropped sink only means nobody is listening any more.
                let _ = sink.send(stamper.stamp(stream, text));
            }
            Err(e) => {
                tracing::debug!("Stopped reading {:?}: {}", stream, e);
                break;
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    pid: u32,
    shared: Arc<Shared>,
    grace: Duration,
    readers: [JoinHandle<()>; 2],
    capture: Arc<Capture>,
    done: oneshot::Sender<Result<Completion, ProcessFailure>>,
) {
    // Settled in the same poll that observed the exit: from then on a cancel
    // is a no-op, even while the readers below are still draining.
    let (status, cancelled) = tokio::select! {
        status = child.wait() => (status, shared.settle()),
        _ = shared.cancel.notified() => {
            let status = terminate(&mut child, pid, grace).await;
            (status, shared.settle())
        }
    };

    // Grandchildren may keep the pipes open after the job itself exited.
    let aborts: Vec<_> = readers.iter().map(JoinHandle::abort_handle).collect();
    let drained = tokio::time::timeout(grace, async move {
        for reader in readers {
            let _ = reader.await;
        }
    })
    .await;
    if drained.is_err() {
        tracing::warn!("Output of process {} still open after exit, abandoning readers", pid);
        aborts.iter().for_each(|a| a.abort());
    }

    let outcome = classify(status, cancelled, capture.take());
    match &outcome {
        Ok(_) => tracing::debug!("Process {} exited cleanly", pid),
        Err(failure) => tracing::debug!(
            "Process {} failed: {} (cancelled: {})",
            pid,
            failure,
            failure.cancelled
        ),
    }
    let _ = done.send(outcome);
}

fn classify(
    status: io::Result<ExitStatus>,
    cancelled: bool,
    stderr: String,
) -> Result<Completion, ProcessFailure> {
    match status {
        Ok(status) if status.success() && !cancelled => Ok(Completion {
            exit_code: 0,
            completed_at: Utc::now(),
        }),
        Ok(status) => Err(ProcessFailure {
            exit_code: status.code(),
            stderr,
            cancelled,
        }),
        Err(e) => {
            tracing::warn!("Failed to collect process exit: {}", e);
            Err(ProcessFailure {
                exit_code: None,
                stderr,
                cancelled,
            })
        }
    }
}

/// SIGTERM the process group, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> io::Result<ExitStatus> {
    signal_terminate(child);
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!("Process {} still running {:?} after SIGTERM, killing", pid, grace);
            signal_kill(child);
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn signal_group(child: &Child, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    // `id()` is `None` once the child has been reaped, so a recycled pid is
    // never signalled.
    let Some(pid) = child.id() else {
        return;
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to send {:?} to process group {}: {}", signal, pid, e),
    }
}

#[cfg(unix)]
fn signal_terminate(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGTERM);
}

#[cfg(unix)]
fn signal_kill(child: &mut Child) {
    signal_group(child, nix::sys::signal::Signal::SIGKILL);
}

#[cfg(not(unix))]
fn signal_terminate(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!("Failed to kill process: {}", e);
    }
}

#[cfg(not(unix))]
fn signal_kill(_child: &mut Child) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> ProcessSpec {
        ProcessSpec::from_argv(vec!["sh".into(), "-c".into(), script.into()])
            .unwrap()
            .with_cancel_grace(Duration::from_secs(2))
    }

    fn collect(mut rx: mpsc::UnboundedReceiver<LogLine>) -> Vec<LogLine> {
        let mut lines = Vec::new();
        while let Ok(line) = rx.try_recv() {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn clean_exit_completes_with_streamed_output() {
        let (tx, rx) = mpsc::unbounded_channel();
        let process = ProcessSupervisor::spawn(sh("echo one; echo two >&2; echo three"), tx).unwrap();
        let completion = process.wait().await.unwrap();
        assert_eq!(completion.exit_code, 0);

        let lines = collect(rx);
        assert_eq!(lines.len(), 3);
        let seqs: Vec<u64> = lines.iter().map(|l| l.seq).collect();
        let mut sorted = seqs.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, vec![0, 1, 2]);

        let stderr: Vec<_> = lines.iter().filter(|l| l.stream == LogStream::Stderr).collect();
        assert_eq!(stderr.len(), 1);
        assert_eq!(stderr[0].text, "two");
        assert_eq!(stderr[0].severity, dispatch_core::Severity::Warn);
    }

    #[tokio::test]
    async fn nonzero_exit_reports_stderr() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = ProcessSupervisor::spawn(sh("echo 'bad input' >&2; exit 3"), tx).unwrap();
        let failure = process.wait().await.unwrap_err();
        assert_eq!(failure.exit_code, Some(3));
        assert!(!failure.cancelled);
        assert_eq!(failure.stderr, "bad input\n");
        assert_eq!(failure.reason(1024), "bad input");
        assert_eq!(failure.reason(3), "bad");
    }

    #[tokio::test]
    async fn empty_stderr_falls_back_to_exit_summary() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let failure = ProcessSupervisor::spawn(sh("exit 7"), tx)
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert_eq!(failure.reason(1024), "process exited with code 7");
    }

    #[tokio::test]
    async fn cancel_terminates_and_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = ProcessSupervisor::spawn(sh("exec sleep 30"), tx).unwrap();
        let handle = process.cancel_handle();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.cancel());
        assert!(!handle.cancel());

        let failure = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(failure.cancelled);
        assert_eq!(failure.exit_code, None);
        assert!(handle.is_settled());
    }

    #[tokio::test]
    async fn cancel_after_exit_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let process = ProcessSupervisor::spawn(sh("true"), tx).unwrap();
        let handle = process.cancel_handle();
        assert!(process.wait().await.is_ok());
        assert!(!handle.cancel());
        assert!(!handle.is_cancel_requested());
    }

    #[tokio::test]
    async fn cancel_while_output_drains_after_exit_is_a_no_op() {
        let (tx, _rx) = mpsc::unbounded_channel();
        // The background sleep keeps both pipes open after the shell exits.
        let spec = sh("sleep 1 & exit 0").with_cancel_grace(Duration::from_secs(3));
        let process = ProcessSupervisor::spawn(spec, tx).unwrap();
        let handle = process.cancel_handle();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !handle.is_settled() {
            assert!(tokio::time::Instant::now() < deadline, "exit never observed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!handle.cancel());
        assert!(!handle.is_cancel_requested());

        let completion = process.wait().await.unwrap();
        assert_eq!(completion.exit_code, 0);
    }

    #[tokio::test]
    async fn handles_know_their_process() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = ProcessSupervisor::spawn(sh("true"), tx.clone()).unwrap();
        let second = ProcessSupervisor::spawn(sh("true"), tx).unwrap();
        assert!(first.cancel_handle().same_process(&first.cancel_handle()));
        assert!(!first.cancel_handle().same_process(&second.cancel_handle()));
        first.wait().await.unwrap();
        second.wait().await.unwrap();
    }

    #[tokio::test]
    async fn ignored_sigterm_escalates_to_kill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let spec = sh("trap '' TERM; while true; do sleep 1; done")
            .with_cancel_grace(Duration::from_millis(300));
        let process = ProcessSupervisor::spawn(spec, tx).unwrap();
        let handle = process.cancel_handle();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(handle.cancel());
        let failure = tokio::time::timeout(Duration::from_secs(5), process.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(failure.cancelled);
    }

    #[tokio::test]
    async fn spawn_errors_are_classified() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let missing = ProcessSpec::from_argv(vec!["definitely-not-a-real-binary-xyz".into()]).unwrap();
        assert!(matches!(
            ProcessSupervisor::spawn(missing, tx.clone()),
            Err(SpawnError::ExecutableNotFound(_))
        ));

        let bad_dir = sh("true").with_work_dir(Some("/nonexistent/dispatch/dir"));
        assert!(matches!(
            ProcessSupervisor::spawn(bad_dir, tx),
            Err(SpawnError::InvalidWorkDir(_))
        ));

        assert!(matches!(ProcessSpec::from_argv(Vec::new()), Err(SpawnError::EmptyCommand)));
    }

    #[tokio::test]
    async fn run_publishes_handle_before_waiting() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut seen = None;
        let completion = ProcessSupervisor::run(sh("echo hi"), tx, |pid, handle| {
            assert_eq!(pid, handle.pid());
            seen = Some(handle);
        })
        .await
        .unwrap();
        assert_eq!(completion.exit_code, 0);
        assert!(seen.unwrap().is_settled());
    }
}
