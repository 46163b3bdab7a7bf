//! Low-level subprocess helpers.
//!
//! Both external binaries go through here: the agent CLI is run to completion
//! with [`run_captured`], and the long-lived tunnel process is shut down with
//! [`terminate`]. Every child is spawned with `kill_on_drop(true)` so a
//! cancelled task never leaks a process.

use std::ffi::OsStr;
use std::fmt::Write;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Max output size kept per stream by [`run_captured`] (1 MB).
///
/// Output beyond this limit is still drained from the pipe (to prevent
/// deadlocks) but discarded. A truncation notice is appended.
pub const MAX_CAPTURED_OUTPUT: usize = 1024 * 1024;

/// Run `program args...` to completion, capturing stdout and stderr.
///
/// Stdout and stderr are read concurrently (to avoid pipe deadlock) and each
/// capped at [`MAX_CAPTURED_OUTPUT`] bytes. If `timeout` elapses first the
/// child is killed and [`RunError::Timeout`] is returned.
pub async fn run_captured<I, S>(
    program: &OsStr,
    args: I,
    timeout: Duration,
) -> Result<CapturedOutput, RunError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(RunError::Spawn)?;

    let mut stdout = child.stdout.take().ok_or(RunError::MissingPipe("stdout"))?;
    let mut stderr = child.stderr.take().ok_or(RunError::MissingPipe("stderr"))?;

    let outcome = tokio::time::timeout(timeout, async {
        let (stdout_data, stderr_data) = tokio::join!(
            read_capped(&mut stdout, MAX_CAPTURED_OUTPUT),
            read_capped(&mut stderr, MAX_CAPTURED_OUTPUT),
        );
        let status = child.wait().await.map_err(RunError::Wait)?;
        Ok::<_, RunError>((status, stdout_data, stderr_data))
    })
    .await;

    match outcome {
        Ok(Ok((status, stdout, stderr))) => Ok(CapturedOutput {
            status,
            stdout,
            stderr,
            duration: start.elapsed(),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            // The join above borrowed the child; it is free again here.
            let _ = child.kill().await;
            Err(RunError::Timeout(timeout))
        }
    }
}

/// Stop a child process: SIGTERM, wait up to `grace`, then SIGKILL.
///
/// Returns the exit status when one was collected. Safe to call on a child
/// that has already exited.
pub async fn terminate(child: &mut Child, grace: Duration) -> Option<ExitStatus> {
    if let Ok(Some(status)) = child.try_wait() {
        return Some(status);
    }

    if let Some(pid) = child.id() {
        #[allow(clippy::cast_possible_wrap)]
        let target = Pid::from_raw(pid as i32);
        if let Err(e) = signal::kill(target, Signal::SIGTERM) {
            debug!("SIGTERM to pid {pid} failed: {e}");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("wait() on terminated child failed: {e}");
            None
        }
        Err(_) => {
            warn!(
                "Child did not exit within {:.1}s of SIGTERM, killing",
                grace.as_secs_f64()
            );
            let _ = child.kill().await;
            child.try_wait().ok().flatten()
        }
    }
}

/// Read from an async reader, keeping the first `max_bytes` and discarding the
/// rest.
///
/// Keeps reading past the cap instead of closing the pipe early, since closing
/// a pipe the child is still writing to gets it killed by SIGPIPE.
async fn read_capped(reader: &mut (impl tokio::io::AsyncRead + Unpin), max_bytes: usize) -> String {
    let mut buf = Vec::with_capacity(max_bytes.min(65536));
    let mut tmp = [0u8; 8192];
    let mut total_read = 0usize;
    loop {
        match reader.read(&mut tmp).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                total_read += n;
                if buf.len() < max_bytes {
                    let take = n.min(max_bytes - buf.len());
                    buf.extend_from_slice(&tmp[..take]);
                }
            }
        }
    }
    let mut s = String::from_utf8_lossy(&buf).into_owned();
    if total_read > max_bytes {
        let _ = write!(
            s,
            "\n[truncated: {total_read} bytes total, showing first {max_bytes}]"
        );
    }
    s
}

/// Result of a process run to completion by [`run_captured`].
#[derive(Debug)]
pub struct CapturedOutput {
    pub status: ExitStatus,
    /// Captured stdout (capped, lossy UTF-8).
    pub stdout: String,
    /// Captured stderr (capped, lossy UTF-8).
    pub stderr: String,
    pub duration: Duration,
}

/// Errors from [`run_captured`].
#[derive(Debug)]
pub enum RunError {
    /// The binary could not be started (not found, permission denied, ...).
    Spawn(std::io::Error),
    /// A piped stdio handle was not available after spawn.
    MissingPipe(&'static str),
    /// The child started but `wait()` failed.
    Wait(std::io::Error),
    /// The child outlived the timeout and was killed.
    Timeout(Duration),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawn(e) => write!(f, "failed to spawn process: {e}"),
            RunError::MissingPipe(name) => write!(f, "failed to take {name} pipe"),
            RunError::Wait(e) => write!(f, "process error: {e}"),
            RunError::Timeout(d) => write!(f, "process timed out after {}s", d.as_secs()),
        }
    }
}

impl std::error::Error for RunError {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captured_collects_both_streams() {
        let out = run_captured(
            OsStr::new("/bin/sh"),
            ["-c", "echo out; echo err >&2; exit 3"],
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_captured_timeout() {
        let err = run_captured(
            OsStr::new("/bin/sh"),
            ["-c", "sleep 5"],
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_run_captured_spawn_failure() {
        let err = run_captured(
            OsStr::new("/nonexistent/definitely-not-here"),
            Vec::<String>::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, RunError::Spawn(_)));
    }

    #[tokio::test]
    async fn test_terminate_running_child() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let status = terminate(&mut child, Duration::from_secs(2)).await;
        assert!(status.is_some());
        assert!(!status.unwrap().success());
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        terminate(&mut child, Duration::from_millis(200)).await;
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exit 0"])
            .spawn()
            .unwrap();
        child.wait().await.unwrap();
        let status = terminate(&mut child, Duration::from_secs(1)).await;
        assert!(status.unwrap().success());
    }
}
