//! Process manager for spawning and supervising tool subprocesses
//!
//! Supports the process kinds the platform launches:
//! - AI assistant CLI
//! - Test runner A (JavaScript)
//! - Test runner B (Python)
//! - Anything else
//!
//! Every spawned child is owned by a reaper task. Callers get a cloneable
//! [`ProcessHandle`] that reports exit, stdio activity, and can escalate
//! termination from SIGTERM to SIGKILL.

use crate::utils::errors::{GovernorError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Kinds of governed subprocesses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessKind {
    AiAssistant,
    TestRunnerA,
    TestRunnerB,
    Other,
}

impl ProcessKind {
    pub const ALL: [ProcessKind; 4] = [
        ProcessKind::AiAssistant,
        ProcessKind::TestRunnerA,
        ProcessKind::TestRunnerB,
        ProcessKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessKind::AiAssistant => "ai-assistant",
            ProcessKind::TestRunnerA => "test-runner-a",
            ProcessKind::TestRunnerB => "test-runner-b",
            ProcessKind::Other => "other",
        }
    }
}

impl fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessKind {
    type Err = GovernorError;

    fn from_str(s: &str) -> Result<Self> {
        ProcessKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| GovernorError::ConfigError(format!("Unknown process kind: {}", s)))
    }
}

/// Configuration for spawning a process
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub kind: ProcessKind,

    pub program: String,

    pub args: Vec<String>,

    /// Working directory
    pub work_dir: Option<String>,

    /// Environment variables
    pub env_vars: Vec<(String, String)>,
}

impl SpawnConfig {
    pub fn new(kind: ProcessKind, program: impl Into<String>) -> Self {
        Self {
            kind,
            program: program.into(),
            args: Vec::new(),
            work_dir: None,
            env_vars: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }
}

/// How a process ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitOutcome {
    pub code: Option<i32>,

    /// Terminating signal, if killed by one
    pub signal: Option<i32>,

    /// Set when waiting on the process failed
    pub error: Option<String>,
}

impl ExitOutcome {
    fn from_wait(result: std::io::Result<ExitStatus>) -> Self {
        match result {
            Ok(status) => {
                #[cfg(unix)]
                let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                #[cfg(not(unix))]
                let signal = None;
                Self {
                    code: status.code(),
                    signal,
                    error: None,
                }
            }
            Err(e) => Self {
                code: None,
                signal: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Output lines buffered per process until a reader catches up
///
/// Lines arriving while the buffer is full are dropped and counted, so an
/// unread chatty process cannot grow memory and never blocks on its pipes.
pub const OUTPUT_BUFFER_LINES: usize = 1024;

/// Which stdio stream produced a line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of subprocess output
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub line: String,
}

/// Cloneable handle to a supervised subprocess
#[derive(Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<ExitOutcome>>,
    activity_rx: watch::Receiver<Instant>,
    kill_token: CancellationToken,
    output: Arc<Mutex<Option<mpsc::Receiver<OutputLine>>>>,
    dropped_lines: Arc<AtomicU64>,
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ProcessHandle {
    /// Take ownership of a spawned child and start its reaper task
    pub fn attach(mut child: Child) -> Self {
        let pid = child.id();
        let (exit_tx, exit_rx) = watch::channel(None);
        let (activity_tx, activity_rx) = watch::channel(Instant::now());
        let activity_tx = Arc::new(activity_tx);
        let (out_tx, out_rx) = mpsc::channel(OUTPUT_BUFFER_LINES);
        let dropped_lines = Arc::new(AtomicU64::new(0));
        let kill_token = CancellationToken::new();

        if let Some(stdout) = child.stdout.take() {
            spawn_pump(
                stdout,
                OutputStream::Stdout,
                out_tx.clone(),
                Arc::clone(&activity_tx),
                Arc::clone(&dropped_lines),
            );
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_pump(
                stderr,
                OutputStream::Stderr,
                out_tx,
                activity_tx,
                Arc::clone(&dropped_lines),
            );
        }

        let token = kill_token.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            let outcome = ExitOutcome::from_wait(result);
            trace!("Reaped PID {:?}: {:?}", pid, outcome);
            exit_tx.send_replace(Some(outcome));
        });

        Self {
            pid,
            exit_rx,
            activity_rx,
            kill_token,
            output: Arc::new(Mutex::new(Some(out_rx))),
            dropped_lines,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit_rx.borrow().is_some()
    }

    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit_rx.borrow().clone()
    }

    /// Wait for the process to exit
    pub async fn wait(&self) -> ExitOutcome {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Reaper dropped without reporting
                return rx.borrow().clone().unwrap_or(ExitOutcome {
                    code: None,
                    signal: None,
                    error: Some("Process reaper stopped unexpectedly".to_string()),
                });
            }
        }
    }

    /// Receiver that changes whenever the process writes to stdout or stderr
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.activity_rx.clone()
    }

    pub fn last_activity(&self) -> Instant {
        *self.activity_rx.borrow()
    }

    /// Take the output line stream. Only the first caller gets it.
    pub fn take_output(&self) -> Option<mpsc::Receiver<OutputLine>> {
        self.output.lock().take()
    }

    /// Lines discarded because the output buffer was full
    pub fn dropped_output_lines(&self) -> u64 {
        self.dropped_lines.load(Ordering::Relaxed)
    }

    fn send_signal(&self, signal: Signal) -> Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        if self.has_exited() {
            return Ok(());
        }
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(GovernorError::RuntimeError(format!(
                "Failed to send {} to PID {}: {}",
                signal, pid, e
            ))),
        }
    }

    /// Ask the process to exit (SIGTERM)
    pub fn signal_terminate(&self) -> Result<()> {
        debug!("Sending SIGTERM to PID {:?}", self.pid);
        self.send_signal(Signal::SIGTERM)
    }

    /// Kill immediately (SIGKILL). Safe to call from synchronous contexts.
    pub fn force_kill(&self) {
        if let Err(e) = self.send_signal(Signal::SIGKILL) {
            warn!("{}", e);
        }
        self.kill_token.cancel();
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL
    pub async fn terminate(&self, grace: Duration) -> ExitOutcome {
        if let Err(e) = self.signal_terminate() {
            warn!("{}", e);
        }

        match tokio::time::timeout(grace, self.wait()).await {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("Process still alive after {:?}, sending SIGKILL to PID {:?}", grace, self.pid);
                self.force_kill();
                self.wait().await
            }
        }
    }
}

fn spawn_pump<R>(
    reader: R,
    stream: OutputStream,
    out_tx: mpsc::Sender<OutputLine>,
    activity_tx: Arc<watch::Sender<Instant>>,
    dropped_lines: Arc<AtomicU64>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            activity_tx.send_replace(Instant::now());
            match out_tx.try_send(OutputLine { stream, line }) {
                // A closed receiver means nobody wants output, which is fine
                Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped_lines.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    });
}

/// Process manager for spawning governed processes
#[derive(Debug, Default)]
pub struct ProcessManager;

impl ProcessManager {
    pub fn new() -> Self {
        Self
    }

    /// Spawn a new process with piped stdio
    pub fn spawn(&self, config: &SpawnConfig) -> Result<ProcessHandle> {
        debug!("Spawning {} process: {} {:?}", config.kind, config.program, config.args);

        let mut command = Command::new(&config.program);
        command.args(&config.args);

        if let Some(work_dir) = &config.work_dir {
            command.current_dir(work_dir);
        }

        for (key, value) in &config.env_vars {
            command.env(key, value);
        }

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(|e| {
            GovernorError::ProcessSpawnFailed(format!("Failed to spawn '{}': {}", config.program, e))
        })?;

        debug!("Process spawned with PID: {:?}", child.id());
        Ok(ProcessHandle::attach(child))
    }

    /// Check if a process is running
    pub fn is_running(&self, pid: u32) -> bool {
        kill(Pid::from_raw(pid as i32), None).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_kind_round_trip_names() {
        assert_eq!(ProcessKind::AiAssistant.as_str(), "ai-assistant");
        assert_eq!("test-runner-b".parse::<ProcessKind>().unwrap(), ProcessKind::TestRunnerB);
        assert!("python".parse::<ProcessKind>().is_err());
        assert_eq!(
            serde_json::to_string(&ProcessKind::TestRunnerA).unwrap(),
            "\"test-runner-a\""
        );
    }

    #[tokio::test]
    async fn test_spawn_and_wait() {
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sh").args(["-c", "exit 3"]))
            .unwrap();

        assert!(handle.pid().is_some());
        let outcome = handle.wait().await;
        assert_eq!(outcome.code, Some(3));
        assert!(handle.has_exited());
    }

    #[tokio::test]
    async fn test_output_updates_activity() {
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sh").args(["-c", "echo hello"]))
            .unwrap();
        let mut output = handle.take_output().unwrap();
        assert!(handle.take_output().is_none());

        let line = output.recv().await.unwrap();
        assert_eq!(line.stream, OutputStream::Stdout);
        assert_eq!(line.line, "hello");
        assert!(handle.wait().await.success());
    }

    #[tokio::test]
    async fn test_unread_output_is_bounded() {
        const LINES: u64 = 5_000;
        let script = format!("yes chatter | head -n {}", LINES);
        let manager = ProcessManager::new();
        let handle = manager
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sh").args(["-c", script.as_str()]))
            .unwrap();
        assert!(handle.wait().await.success());

        let expected_dropped = LINES - OUTPUT_BUFFER_LINES as u64;
        for _ in 0..100 {
            if handle.dropped_output_lines() >= expected_dropped {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(handle.dropped_output_lines(), expected_dropped);

        let mut output = handle.take_output().unwrap();
        let mut buffered = 0;
        while output.try_recv().is_ok() {
            buffered += 1;
        }
        assert_eq!(buffered, OUTPUT_BUFFER_LINES);
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_sigkill() {
        let manager = ProcessManager::new();
        // Ignores SIGTERM, so only SIGKILL ends it
        let handle = manager
            .spawn(&SpawnConfig::new(ProcessKind::Other, "sh").args([
                "-c",
                "trap '' TERM; while true; do sleep 1; done",
            ]))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let outcome = handle.terminate(Duration::from_millis(300)).await;
        assert_eq!(outcome.signal, Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let manager = ProcessManager::new();
        let result = manager.spawn(&SpawnConfig::new(ProcessKind::Other, "definitely-not-a-binary-xyz"));
        assert!(matches!(result, Err(GovernorError::ProcessSpawnFailed(_))));
    }
}
