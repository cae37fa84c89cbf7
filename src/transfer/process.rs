//! Running external tools under a cancellation token.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::{CancelToken, TransferError};

/// Runs `program` with `args` to completion.
///
/// Standard error is captured for the failure message. If `token` fires
/// first, the child is killed and [`TransferError::Cancelled`] is returned.
pub(crate) async fn run_tool<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    token: &CancelToken,
) -> Result<(), TransferError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    debug!(program, "spawning tool");
    let mut child = command
        .spawn()
        .map_err(|e| TransferError::spawn(program, e))?;
    let stderr_task = collect_stderr(&mut child);
    wait_with_stderr(program, child, stderr_task, token).await
}

/// Starts draining the child's stderr so a chatty tool cannot block on a full pipe.
pub(crate) fn collect_stderr(child: &mut Child) -> Option<JoinHandle<String>> {
    child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buffer = String::new();
            let _ = stderr.read_to_string(&mut buffer).await;
            buffer
        })
    })
}

/// Waits for `child` and converts its exit status, killing it if `token` fires.
pub(crate) async fn wait_with_stderr(
    program: &str,
    mut child: Child,
    stderr_task: Option<JoinHandle<String>>,
    token: &CancelToken,
) -> Result<(), TransferError> {
    let status = tokio::select! {
        biased;
        () = token.cancelled() => {
            let _ = child.kill().await;
            return Err(TransferError::Cancelled);
        }
        status = child.wait() => status.map_err(|e| TransferError::spawn(program, e))?,
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };
    check_status(program, status, &stderr)
}

fn check_status(program: &str, status: ExitStatus, stderr: &str) -> Result<(), TransferError> {
    if status.success() {
        return Ok(());
    }
    Err(TransferError::Process {
        program: program.to_string(),
        code: status.code(),
        stderr: stderr.trim().to_string(),
    })
}
