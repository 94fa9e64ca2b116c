//! Process management layer
//!
//! A [`ProcessHandle`] owns one spawned downstream server: its pid, its three
//! piped streams and its lifecycle state. Handles are never reused; a restart
//! spawns a fresh handle with the next generation number.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, info, trace, warn};

use crate::bridge::config::ServerDescriptor;
use crate::io::transport::{ReadOutcome, read_line_frame};

// ============================================================================
// Process State Management
// ============================================================================

/// How a downstream process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// Exit code, absent when the process was terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn from_status(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "Exit code {code}"),
            None => write!(f, "Terminated by signal"),
        }
    }
}

/// Process lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Process is currently running
    Running { pid: u32 },
    /// Process ended on its own
    Exited(ProcessExit),
    /// Termination has been requested and is in progress
    Terminating,
    /// Process was stopped by the bridge
    Terminated,
}

impl ProcessState {
    /// Check if the process is currently running
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

/// How a termination request completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// The process had already exited before it was signalled
    AlreadyExited(ProcessExit),
    /// The process exited within the grace timeout
    Graceful(ProcessExit),
    /// The grace timeout elapsed and the process was killed
    Forced,
}

// ============================================================================
// Process Errors
// ============================================================================

/// Errors that can occur while driving a downstream process
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("Process exited before its pid could be read")]
    NoPid,

    #[error("Stdin not available")]
    StdinNotAvailable,

    #[error("Stdout not available")]
    StdoutNotAvailable,

    #[error("Stderr not available")]
    StderrNotAvailable,
}

// ============================================================================
// Process Handle
// ============================================================================

/// One live downstream server process.
///
/// Each stream sits behind its own async mutex so the three relay pumps can
/// use the same handle concurrently. A stream that reached EOF or failed is
/// dropped and reads as EOF from then on.
#[derive(Debug)]
pub struct ProcessHandle {
    pid: u32,
    generation: u32,
    started_at: Instant,
    child: tokio::sync::Mutex<Child>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    stdout: tokio::sync::Mutex<Option<BufReader<ChildStdout>>>,
    stderr: tokio::sync::Mutex<Option<BufReader<ChildStderr>>>,
    state: Mutex<ProcessState>,
}

impl ProcessHandle {
    /// Spawn the process described by `descriptor`.
    ///
    /// The environment is inherited and overlaid with the descriptor's
    /// entries; the working directory defaults to the bridge's own.
    pub fn spawn(descriptor: &ServerDescriptor, generation: u32) -> Result<Self, ProcessError> {
        let mut command = Command::new(&descriptor.command);
        command
            .args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &descriptor.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            command: descriptor.command.clone(),
            source,
        })?;

        let pid = child.id().ok_or(ProcessError::NoPid)?;
        let stdin = child.stdin.take().ok_or(ProcessError::StdinNotAvailable)?;
        let stdout = child.stdout.take().ok_or(ProcessError::StdoutNotAvailable)?;
        let stderr = child.stderr.take().ok_or(ProcessError::StderrNotAvailable)?;

        info!(
            "Spawned '{} {}' with PID {} (generation {})",
            descriptor.command,
            descriptor.args.join(" "),
            pid,
            generation
        );

        Ok(Self {
            pid,
            generation,
            started_at: Instant::now(),
            child: tokio::sync::Mutex::new(child),
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            stdout: tokio::sync::Mutex::new(Some(BufReader::new(stdout))),
            stderr: tokio::sync::Mutex::new(Some(BufReader::new(stderr))),
            state: Mutex::new(ProcessState::Running { pid }),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Spawn counter of this handle within its session (0 for the first)
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn state(&self) -> ProcessState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Non-blocking liveness check.
    ///
    /// Returns the exit information once the process has ended. While a
    /// termination is in progress the child is busy and this reports `None`.
    pub fn try_exit(&self) -> Result<Option<ProcessExit>, ProcessError> {
        let Ok(mut child) = self.child.try_lock() else {
            return Ok(None);
        };
        match child.try_wait()? {
            Some(status) => {
                let exit = ProcessExit::from_status(status);
                if self.state().is_running() {
                    self.set_state(ProcessState::Exited(exit));
                }
                Ok(Some(exit))
            }
            None => Ok(None),
        }
    }

    /// Write one frame to the process input and flush it immediately.
    ///
    /// A failed write closes the input so later writes fail fast.
    pub async fn write_frame(&self, frame: &[u8]) -> Result<(), ProcessError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProcessError::StdinNotAvailable)?;

        let result = async {
            stdin.write_all(frame).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = result {
            guard.take();
            return Err(ProcessError::Io(e));
        }
        trace!("PID {}: wrote {} bytes to stdin", self.pid, frame.len());
        Ok(())
    }

    /// Read one frame from the process output into `buf`
    pub async fn read_stdout_frame(&self, buf: &mut Vec<u8>) -> Result<ReadOutcome, ProcessError> {
        let mut guard = self.stdout.lock().await;
        let Some(reader) = guard.as_mut() else {
            buf.clear();
            return Ok(ReadOutcome::Eof);
        };
        match read_line_frame(reader, buf).await {
            Ok(ReadOutcome::Eof) => {
                debug!("PID {}: stdout reached EOF", self.pid);
                guard.take();
                Ok(ReadOutcome::Eof)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                guard.take();
                Err(ProcessError::Io(e))
            }
        }
    }

    /// Read one frame from the process error stream into `buf`
    pub async fn read_stderr_frame(&self, buf: &mut Vec<u8>) -> Result<ReadOutcome, ProcessError> {
        let mut guard = self.stderr.lock().await;
        let Some(reader) = guard.as_mut() else {
            buf.clear();
            return Ok(ReadOutcome::Eof);
        };
        match read_line_frame(reader, buf).await {
            Ok(ReadOutcome::Eof) => {
                guard.take();
                Ok(ReadOutcome::Eof)
            }
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                guard.take();
                Err(ProcessError::Io(e))
            }
        }
    }

    /// Collect whatever is left on the error stream, bounded by `timeout`.
    ///
    /// Used after the process died during startup to report why.
    pub async fn drain_stderr(&self, timeout: Duration) -> String {
        let mut captured = Vec::new();
        let drained = tokio::time::timeout(timeout, async {
            // The error pump may hold the stream; the timeout covers that wait too
            let mut guard = self.stderr.lock().await;
            match guard.as_mut() {
                Some(reader) => reader.read_to_end(&mut captured).await.map(|_| ()),
                None => Ok(()),
            }
        })
        .await;

        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("PID {}: error while draining stderr: {}", self.pid, e),
            Err(_) => debug!("PID {}: stderr drain timed out", self.pid),
        }
        String::from_utf8_lossy(&captured).trim().to_string()
    }

    /// Stop the process: close its input, ask it to exit, and kill it if it
    /// is still alive after `timeout`.
    pub async fn terminate(&self, timeout: Duration) -> Result<TerminationOutcome, ProcessError> {
        self.set_state(ProcessState::Terminating);

        // Closing stdin alone is enough for most servers to exit
        self.stdin.lock().await.take();

        let mut child = self.child.lock().await;
        if let Some(status) = child.try_wait()? {
            let exit = ProcessExit::from_status(status);
            self.set_state(ProcessState::Terminated);
            debug!("PID {} had already exited ({})", self.pid, exit);
            return Ok(TerminationOutcome::AlreadyExited(exit));
        }

        info!("Gracefully stopping process with PID: {}", self.pid);

        #[cfg(unix)]
        {
            // SAFETY: plain signal delivery to a pid we spawned and have not reaped
            unsafe {
                if libc::kill(self.pid as libc::pid_t, libc::SIGTERM) == 0 {
                    debug!("Sent SIGTERM to process {}", self.pid);
                }
            }
        }
        #[cfg(not(unix))]
        {
            child.start_kill()?;
        }

        let outcome = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => TerminationOutcome::Graceful(ProcessExit::from_status(status?)),
            Err(_) => {
                warn!(
                    "Process {} did not exit within {:?}, killing it",
                    self.pid, timeout
                );
                child.kill().await?;
                TerminationOutcome::Forced
            }
        };

        self.set_state(ProcessState::Terminated);
        Ok(outcome)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> ServerDescriptor {
        ServerDescriptor::new("sh").arg("-c").arg(script)
    }

    async fn wait_for_exit(handle: &ProcessHandle) -> ProcessExit {
        for _ in 0..100 {
            if let Some(exit) = handle.try_exit().unwrap() {
                return exit;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {} did not exit", handle.pid());
    }

    #[tokio::test]
    async fn test_process_handle_lifecycle() {
        let handle = ProcessHandle::spawn(&ServerDescriptor::new("cat"), 0).unwrap();
        assert!(handle.state().is_running());
        assert_eq!(handle.state(), ProcessState::Running { pid: handle.pid() });
        assert!(handle.try_exit().unwrap().is_none());

        handle.write_frame(b"{\"id\":1}\n").await.unwrap();
        let mut buf = Vec::new();
        let outcome = handle.read_stdout_frame(&mut buf).await.unwrap();
        assert_eq!(outcome, ReadOutcome::Line(9));
        assert_eq!(buf, b"{\"id\":1}\n");

        let outcome = handle.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            outcome,
            TerminationOutcome::Graceful(_) | TerminationOutcome::AlreadyExited(_)
        ));
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr_capture() {
        let handle = ProcessHandle::spawn(&sh("echo 'fatal: bad flag' >&2; exit 3"), 0).unwrap();

        let exit = wait_for_exit(&handle).await;
        assert_eq!(exit.code, Some(3));
        assert_eq!(exit.to_string(), "Exit code 3");
        assert_eq!(handle.state(), ProcessState::Exited(exit));

        let stderr = handle.drain_stderr(Duration::from_secs(1)).await;
        assert_eq!(stderr, "fatal: bad flag");
    }

    #[tokio::test]
    async fn test_signal_exit_has_no_code() {
        let handle = ProcessHandle::spawn(&sh("kill -9 $$"), 0).unwrap();
        let exit = wait_for_exit(&handle).await;
        assert_eq!(exit.code, None);
        assert_eq!(exit.to_string(), "Terminated by signal");
    }

    #[tokio::test]
    async fn test_stdout_eof_is_sticky() {
        let handle = ProcessHandle::spawn(&sh("echo one"), 0).unwrap();
        let mut buf = Vec::new();

        handle.read_stdout_frame(&mut buf).await.unwrap();
        assert_eq!(buf, b"one\n");
        assert_eq!(
            handle.read_stdout_frame(&mut buf).await.unwrap(),
            ReadOutcome::Eof
        );
        assert_eq!(
            handle.read_stdout_frame(&mut buf).await.unwrap(),
            ReadOutcome::Eof
        );
    }

    #[tokio::test]
    async fn test_environment_overlay_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut descriptor = sh("echo \"$BRIDGE_TEST_VALUE\"; pwd");
        descriptor
            .env
            .insert("BRIDGE_TEST_VALUE".to_string(), "overlaid".to_string());
        descriptor.cwd = Some(dir.path().to_path_buf());

        let handle = ProcessHandle::spawn(&descriptor, 0).unwrap();
        let mut buf = Vec::new();
        handle.read_stdout_frame(&mut buf).await.unwrap();
        assert_eq!(buf, b"overlaid\n");

        handle.read_stdout_frame(&mut buf).await.unwrap();
        let printed = std::path::PathBuf::from(String::from_utf8_lossy(&buf).trim());
        assert_eq!(
            printed.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        // An ignored signal disposition survives exec
        let handle = ProcessHandle::spawn(&sh("trap '' TERM; exec sleep 30"), 0).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let outcome = handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(outcome, TerminationOutcome::Forced);
        assert_eq!(handle.state(), ProcessState::Terminated);
    }

    #[tokio::test]
    async fn test_terminate_after_exit() {
        let handle = ProcessHandle::spawn(&sh("exit 0"), 0).unwrap();
        wait_for_exit(&handle).await;

        let outcome = handle.terminate(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, TerminationOutcome::AlreadyExited(exit) if exit.success()));
    }

    #[tokio::test]
    async fn test_write_after_terminate_fails() {
        let handle = ProcessHandle::spawn(&ServerDescriptor::new("cat"), 1).unwrap();
        assert_eq!(handle.generation(), 1);
        handle.terminate(Duration::from_secs(5)).await.unwrap();

        let err = handle.write_frame(b"late\n").await.unwrap_err();
        assert!(matches!(err, ProcessError::StdinNotAvailable));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = ProcessHandle::spawn(&ServerDescriptor::new("/nonexistent/mcp-server"), 0)
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
        assert!(err.to_string().contains("/nonexistent/mcp-server"));
    }
}
