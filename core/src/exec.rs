//! Subprocess plumbing shared by the shell tool and the git service.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::GatewayErr;
use crate::error::Result;

/// Per-stream line cap applied on top of the byte cap.
const MAX_OUTPUT_LINES: usize = 4096;

const SIGINT_EXIT_CODE: i32 = 130;
const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Run `command` through `sh -c` in `cwd`, capturing capped output.
///
/// Cancellation sends SIGINT to the child and reports [`GatewayErr::Cancelled`];
/// a timeout kills the child and synthesizes exit code 124 with whatever
/// output was captured up to that point.
pub(crate) async fn run_shell(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> Result<ShellOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        // No stdin pipe: some tools try to read from an open stdin and hang.
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn()?;
    capture_child(child, timeout, max_output_bytes, cancel).await
}

/// Wait for `child`, enforcing the timeout and the cancellation token while
/// draining both output pipes with byte and line caps.
pub(crate) async fn capture_child(
    mut child: Child,
    timeout: Duration,
    max_output_bytes: usize,
    cancel: &CancellationToken,
) -> Result<ShellOutput> {
    let stdout_pipe = child
        .stdout
        .take()
        .ok_or_else(|| GatewayErr::Sandbox("stdout pipe unavailable".to_string()))?;
    let stderr_pipe = child
        .stderr
        .take()
        .ok_or_else(|| GatewayErr::Sandbox("stderr pipe unavailable".to_string()))?;

    let stdout_handle = tokio::spawn(read_capped(BufReader::new(stdout_pipe), max_output_bytes));
    let stderr_handle = tokio::spawn(read_capped(BufReader::new(stderr_pipe), max_output_bytes));

    let mut cancelled = false;
    let exit_code = tokio::select! {
        result = tokio::time::timeout(timeout, child.wait()) => {
            match result {
                Ok(Ok(status)) => status.code().unwrap_or(-1),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    child.start_kill()?;
                    TIMEOUT_EXIT_CODE
                }
            }
        }
        _ = cancel.cancelled() => {
            cancelled = true;
            interrupt_child(&mut child).await;
            SIGINT_EXIT_CODE
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_handle.await??).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_handle.await??).into_owned();

    if cancelled {
        return Err(GatewayErr::Cancelled);
    }

    Ok(ShellOutput {
        stdout,
        stderr,
        exit_code,
    })
}

/// SIGINT first so the child can clean up; escalate to SIGKILL if it is
/// still alive shortly after.
async fn interrupt_child(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGINT);
        }
        let grace = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
        if grace.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

/// Read to EOF, retaining only the first `max_output` bytes and
/// [`MAX_OUTPUT_LINES`] lines. Reading continues past the caps so the child
/// never blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(mut reader: R, max_output: usize) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(max_output.min(8 * 1024));
    let mut tmp = [0u8; 8192];

    let mut remaining_bytes = max_output;
    let mut remaining_lines = MAX_OUTPUT_LINES;

    loop {
        let n = reader.read(&mut tmp).await?;
        if n == 0 {
            break;
        }

        if remaining_bytes > 0 && remaining_lines > 0 {
            let mut copy_len = 0;
            for &b in &tmp[..n] {
                if remaining_bytes == 0 || remaining_lines == 0 {
                    break;
                }
                copy_len += 1;
                remaining_bytes -= 1;
                if b == b'\n' {
                    remaining_lines -= 1;
                }
            }
            buf.extend_from_slice(&tmp[..copy_len]);
        }
    }

    Ok(buf)
}
