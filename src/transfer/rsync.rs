//! rsync-based listing and transfer for directory-listing sources.
//!
//! Listing output (`rsync --list-only -r`) looks like:
//!
//! ```text
//! drwxr-xr-x          4,096 2016/05/02 10:11:12 .
//! drwxr-xr-x          4,096 2016/05/02 10:11:12 1
//! -rw-r--r--      1,048,576 2016/05/02 10:11:12 1/images/img_0001.img
//! ```
//!
//! Progress output (`--progress`) rewrites one line per file with `\r`:
//!
//! ```text
//!      1,238,528  45%  117.95MB/s    0:00:00
//!      2,752,512 100%  104.56MB/s    0:00:00 (xfr#1, to-chk=3/5)
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::process::{collect_stderr, wait_with_stderr};
use super::{CancelToken, ProgressFn, TransferError};

/// Handle on the rsync executable.
#[derive(Debug, Clone)]
pub struct Rsync {
    program: PathBuf,
}

impl Rsync {
    /// Uses the given executable (a bare name is resolved through `PATH`).
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn program_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Runs a recursive listing of `remote` and returns the raw output.
    ///
    /// # Errors
    ///
    /// Returns a spawn or process error if rsync fails.
    #[instrument(skip(self, token), fields(remote = %remote))]
    pub async fn list(&self, remote: &str, token: &CancelToken) -> Result<String, TransferError> {
        let mut child = Command::new(&self.program)
            .args(["--list-only", "-r", remote])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::spawn(self.program_name(), e))?;

        let stderr_task = collect_stderr(&mut child);
        let stdout_task = child.stdout.take().map(|mut stdout| {
            tokio::spawn(async move {
                let mut buffer = String::new();
                let _ = stdout.read_to_string(&mut buffer).await;
                buffer
            })
        });
        wait_with_stderr(&self.program_name(), child, stderr_task, token).await?;
        let output = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        debug!(bytes = output.len(), "listing received");
        Ok(output)
    }

    /// Recursively copies `remote` into `dest`, reporting cumulative bytes.
    ///
    /// Re-running against a partially populated `dest` only transfers what is
    /// missing, which is how interrupted transfers resume.
    ///
    /// # Errors
    ///
    /// Returns a spawn or process error if rsync fails, or
    /// [`TransferError::Cancelled`] if `token` fires.
    #[instrument(skip(self, token, progress), fields(remote = %remote, dest = %dest.display()))]
    pub async fn transfer(
        &self,
        remote: &str,
        dest: &Path,
        token: &CancelToken,
        progress: ProgressFn<'_>,
    ) -> Result<u64, TransferError> {
        let mut destination = dest.as_os_str().to_owned();
        destination.push("/");
        let mut child = Command::new(&self.program)
            .args(["-r", "--partial", "--progress"])
            .arg(remote)
            .arg(&destination)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::spawn(self.program_name(), e))?;

        let stderr_task = collect_stderr(&mut child);
        let mut tracker = ProgressTracker::default();
        if let Some(mut stdout) = child.stdout.take() {
            let mut splitter = LineSplitter::default();
            let mut chunk = [0u8; 8192];
            loop {
                let read = tokio::select! {
                    biased;
                    () = token.cancelled() => {
                        let _ = child.kill().await;
                        return Err(TransferError::Cancelled);
                    }
                    read = stdout.read(&mut chunk) => read,
                };
                let read = read.map_err(|e| TransferError::io(dest, e))?;
                if read == 0 {
                    break;
                }
                for line in splitter.push(&chunk[..read]) {
                    if let Some(total) = tracker.observe(&line) {
                        progress(total);
                    }
                }
            }
        }
        wait_with_stderr(&self.program_name(), child, stderr_task, token).await?;
        Ok(tracker.total())
    }
}

/// Splits a byte stream on both `\r` and `\n`.
#[derive(Debug, Default)]
struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }
}

/// Accumulates per-file progress lines into a running byte total.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    committed: u64,
    current: u64,
}

impl ProgressTracker {
    /// Feeds one output line; returns the new total when the line was a progress line.
    pub fn observe(&mut self, line: &str) -> Option<u64> {
        let mut fields = line.split_whitespace();
        let bytes = parse_size(fields.next()?)?;
        let percent = fields.next()?;
        if !percent.ends_with('%') {
            return None;
        }
        if line.contains("xfr#") {
            self.committed = self.committed.saturating_add(bytes);
            self.current = 0;
        } else {
            self.current = bytes;
        }
        Some(self.total())
    }

    /// Bytes of completed files plus the in-flight file.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.committed.saturating_add(self.current)
    }
}

/// Parses an rsync size column such as `1,048,576`.
fn parse_size(field: &str) -> Option<u64> {
    let digits: String = field.chars().filter(|c| *c != ',').collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Sums file sizes per top-level directory of a recursive listing.
///
/// Sizes accumulate for the most recently seen top-level directory and are
/// committed when the next top-level directory line appears, and at the end
/// of input. Paths may contain spaces; everything from the fifth field on is
/// re-joined as the path.
#[must_use]
pub fn parse_listing(output: &str) -> BTreeMap<String, u64> {
    let mut sizes = BTreeMap::new();
    let mut current: Option<String> = None;
    let mut accumulated: u64 = 0;

    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let path = fields[4..].join(" ");
        if path == "." {
            continue;
        }
        let is_dir = fields[0].starts_with('d');
        if is_dir && !path.contains('/') {
            if let Some(previous) = current.take() {
                sizes.insert(previous, accumulated);
            }
            current = Some(path);
            accumulated = 0;
        } else if !is_dir && current.is_some() {
            accumulated = accumulated.saturating_add(parse_size(fields[1]).unwrap_or(0));
        }
    }
    if let Some(previous) = current {
        sizes.insert(previous, accumulated);
    }
    sizes
}
