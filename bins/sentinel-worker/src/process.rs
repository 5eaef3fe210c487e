//! Child-process invocation with hard caps.
//!
//! Every run gets piped stdio, a forceful kill on timeout or output
//! overflow, and a guarantee that the child has been reaped before the
//! call returns.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

/// Cap applied independently to captured stdout and stderr.
pub const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Execution timeout")]
    Timeout,
    #[error("Output size exceeded limit")]
    OutputLimit,
    #[error("Failed to start process: {0}")]
    Spawn(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct RunOutput {
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
    /// Exit code; a missing code (signal death) is normalized to 0 only
    /// after a clean close, never on an enforced kill.
    pub exit_code: i32,
    pub duration: Duration,
}

enum WaitOutcome {
    Exited(ExitStatus),
    Failed(ExecError),
}

/// Run `program args...` in `cwd`, feeding `stdin` and enforcing the
/// wall-clock `timeout` and the output caps.
pub async fn run(
    program: &str,
    args: &[String],
    cwd: &Path,
    stdin: &str,
    timeout: Duration,
) -> Result<RunOutput, ExecError> {
    let started = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    {
        // CREATE_NO_WINDOW so user programs cannot pop consoles.
        cmd.creation_flags(0x0800_0000);
    }

    let mut child = cmd.spawn()?;

    // Write the full input, then close stdin so programs reading until EOF
    // terminate.
    if let Some(mut sink) = child.stdin.take() {
        let input = stdin.as_bytes().to_vec();
        tokio::spawn(async move {
            let _ = sink.write_all(&input).await;
            let _ = sink.shutdown().await;
        });
    }

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return Err(ExecError::Spawn(std::io::Error::other(
            "failed to capture child stdio",
        )));
    };

    let (overflow_tx, mut overflow_rx) = mpsc::channel::<()>(2);
    let stdout_task = tokio::spawn(read_capped(stdout, overflow_tx.clone()));
    let stderr_task = tokio::spawn(read_capped(stderr, overflow_tx));

    let outcome = {
        let wait = child.wait();
        tokio::pin!(wait);
        tokio::select! {
            res = tokio::time::timeout(timeout, &mut wait) => match res {
                Ok(Ok(status)) => WaitOutcome::Exited(status),
                Ok(Err(e)) => WaitOutcome::Failed(ExecError::Spawn(e)),
                Err(_) => WaitOutcome::Failed(ExecError::Timeout),
            },
            _ = overflow_rx.recv() => WaitOutcome::Failed(ExecError::OutputLimit),
        }
    };

    if matches!(outcome, WaitOutcome::Failed(_)) {
        let _ = child.start_kill();
        let _ = child.wait().await;
    }

    let (stdout_bytes, stdout_overflow) = stdout_task
        .await
        .unwrap_or_else(|_| (Vec::new(), false));
    let (stderr_bytes, stderr_overflow) = stderr_task
        .await
        .unwrap_or_else(|_| (Vec::new(), false));

    match outcome {
        WaitOutcome::Failed(e) => Err(e),
        // A fast child can exit before the overflow signal is observed.
        WaitOutcome::Exited(_) if stdout_overflow || stderr_overflow => {
            Err(ExecError::OutputLimit)
        }
        WaitOutcome::Exited(status) => Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout_bytes).trim().to_string(),
            stderr: String::from_utf8_lossy(&stderr_bytes).trim().to_string(),
            exit_code: status.code().unwrap_or(0),
            duration: started.elapsed(),
        }),
    }
}

/// Accumulate a pipe up to the cap. On overflow, signal the runner (which
/// kills the child) and stop reading; the partial buffer is discarded by
/// the caller.
async fn read_capped<R>(mut pipe: R, overflow: mpsc::Sender<()>) -> (Vec<u8>, bool)
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => return (buf, false),
            Ok(n) => {
                if buf.len() + n > MAX_CAPTURED_BYTES {
                    let _ = overflow.try_send(());
                    return (buf, true);
                }
                buf.extend_from_slice(&chunk[..n]);
            }
        }
    }
}
