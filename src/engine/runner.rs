// src/engine/runner.rs - External scanner process management
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, warn};

use crate::error::{ScanError, ScanResult};

/// Depth of the line buffer between the process readers and the consumer.
const LINE_BUFFER: usize = 1024;

/// Seam between the scan manager and the operating system. Mockable so the
/// manager can be tested without spawning anything.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Spawn the scanner. Fails with `LaunchFailed` when the binary cannot
    /// be started; a failed start never yields a handle.
    async fn start(
        &self,
        binary: &str,
        args: &[String],
        timeout: Duration,
    ) -> ScanResult<Box<dyn ProcessHandle>>;
}

/// A live scanner process. The line stream is single-consumption; lines are
/// stdout and stderr merged in order of arrival.
#[async_trait]
pub trait ProcessHandle: Send {
    /// Next output line, `None` at end of stream. Fails with
    /// `TimeoutExceeded` once the process deadline passes; the caller is
    /// expected to cancel after that.
    async fn next_line(&mut self) -> ScanResult<Option<String>>;

    /// Terminate the process: termination signal, bounded grace period,
    /// then hard kill. Guarantees the child is reaped. Idempotent; calling
    /// it on an already-exited process is a no-op.
    async fn cancel(&mut self) -> ScanResult<()>;

    /// Wait for exit and return the exit code, `None` when killed by a
    /// signal.
    async fn wait(&mut self) -> ScanResult<Option<i32>>;
}

/// Production runner driving the real scanner binary.
pub struct NmapRunner {
    grace: Duration,
}

impl NmapRunner {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl ProcessRunner for NmapRunner {
    async fn start(
        &self,
        binary: &str,
        args: &[String],
        timeout: Duration,
    ) -> ScanResult<Box<dyn ProcessHandle>> {
        debug!("Spawning {} {}", binary, args.join(" "));

        let mut child = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ScanError::LaunchFailed(format!("{}: {}", binary, e)))?;

        let (tx, rx) = mpsc::channel(LINE_BUFFER);
        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, tx);
        }

        Ok(Box::new(NmapHandle {
            child,
            lines: rx,
            deadline: Instant::now() + timeout,
            timeout_secs: timeout.as_secs(),
            grace: self.grace,
            cancelled: false,
        }))
    }
}

/// Forward lines from one pipe into the shared channel. The channel bound
/// applies backpressure to the child instead of buffering without limit.
fn pump_lines<R>(reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).await.is_err() {
                break;
            }
        }
    });
}

/// Ask the child to terminate, catchably where the platform allows, so a
/// scan can flush partial output before exiting. Returns false when the
/// child has already exited.
#[cfg(unix)]
fn send_term(child: &mut Child) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match child.id() {
        Some(pid) => kill(Pid::from_raw(pid as i32), Signal::SIGTERM).is_ok(),
        None => false,
    }
}

#[cfg(not(unix))]
fn send_term(child: &mut Child) -> bool {
    child.start_kill().is_ok()
}

struct NmapHandle {
    child: Child,
    lines: mpsc::Receiver<String>,
    deadline: Instant,
    timeout_secs: u64,
    grace: Duration,
    cancelled: bool,
}

#[async_trait]
impl ProcessHandle for NmapHandle {
    async fn next_line(&mut self) -> ScanResult<Option<String>> {
        match timeout_at(self.deadline, self.lines.recv()).await {
            Ok(line) => Ok(line),
            Err(_) => Err(ScanError::TimeoutExceeded {
                seconds: self.timeout_secs,
            }),
        }
    }

    async fn cancel(&mut self) -> ScanResult<()> {
        if self.cancelled {
            return Ok(());
        }
        self.cancelled = true;

        // A failed signal means the child already exited; that is the
        // completion-vs-cancel race resolving itself.
        if !send_term(&mut self.child) {
            return Ok(());
        }
        match timeout(self.grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("Scanner ignored termination signal, killing");
                self.child.kill().await?;
            }
        }
        Ok(())
    }

    async fn wait(&mut self) -> ScanResult<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> NmapRunner {
        NmapRunner::new(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn missing_binary_is_launch_failed() {
        let err = runner()
            .start("/definitely/not/here", &[], Duration::from_secs(5))
            .await
            .err()
            .expect("spawn should fail");
        assert!(matches!(err, ScanError::LaunchFailed(_)));
    }

    #[tokio::test]
    async fn streams_lines_and_exit_code() {
        let args = vec!["-c".to_string(), "echo one; echo two; exit 3".to_string()];
        let mut handle = runner()
            .start("sh", &args, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(handle.next_line().await.unwrap().as_deref(), Some("one"));
        assert_eq!(handle.next_line().await.unwrap().as_deref(), Some("two"));
        assert_eq!(handle.next_line().await.unwrap(), None);
        assert_eq!(handle.wait().await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn stderr_is_merged_into_the_stream() {
        let args = vec!["-c".to_string(), "echo oops >&2".to_string()];
        let mut handle = runner()
            .start("sh", &args, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(handle.next_line().await.unwrap().as_deref(), Some("oops"));
        assert_eq!(handle.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn deadline_expiry_reports_timeout() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut handle = runner()
            .start("sh", &args, Duration::from_millis(50))
            .await
            .unwrap();
        let err = handle.next_line().await.err().expect("should time out");
        assert!(matches!(err, ScanError::TimeoutExceeded { .. }));
        handle.cancel().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_delivers_a_catchable_signal_before_killing() {
        let args = vec![
            "-c".to_string(),
            "trap 'exit 0' TERM; while true; do sleep 0.1; done".to_string(),
        ];
        let mut handle = runner()
            .start("sh", &args, Duration::from_secs(5))
            .await
            .unwrap();
        // Let the shell install its trap first.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.cancel().await.unwrap();
        // A graceful exit through the trap, not a kill.
        assert_eq!(handle.wait().await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn cancel_is_idempotent_and_reaps() {
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut handle = runner()
            .start("sh", &args, Duration::from_secs(5))
            .await
            .unwrap();
        handle.cancel().await.unwrap();
        handle.cancel().await.unwrap();
        // Killed by signal, so no exit code.
        assert_eq!(handle.wait().await.unwrap(), None);
    }
}
