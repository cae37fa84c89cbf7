//! Writing client uploads into an entry directory.
//!
//! The writer is transport-agnostic: each uploaded file is a name plus a
//! stream of byte chunks, which is what a multipart field provides.

use std::fmt::Display;
use std::path::{Path, PathBuf};

use futures_util::{Stream, StreamExt};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};

use super::filename::sanitize_relative_path;
use super::{CancelToken, TransferError};

/// Writes uploaded files under one directory, enforcing a cumulative size limit.
#[derive(Debug)]
pub struct UploadWriter {
    dir: PathBuf,
    limit: u64,
    written: u64,
    files: Vec<PathBuf>,
}

impl UploadWriter {
    /// Creates a writer rooted at `dir` accepting at most `limit` bytes in total.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, limit: u64) -> Self {
        Self {
            dir: dir.into(),
            limit,
            written: 0,
            files: Vec::new(),
        }
    }

    /// Total bytes accepted so far.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Paths of the files written so far.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// Streams one uploaded file to disk.
    ///
    /// The limit is checked before every chunk is written, so an oversized
    /// upload is rejected as soon as it crosses the limit rather than after
    /// the whole body has been received.
    ///
    /// # Errors
    ///
    /// Returns [`TransferError::UnsafePath`] for a name that could escape the
    /// directory, [`TransferError::LimitExceeded`] when the limit is crossed,
    /// [`TransferError::Upload`] when the body stream fails, IO errors, or
    /// `Cancelled`.
    #[instrument(skip(self, stream, token), fields(dir = %self.dir.display()))]
    pub async fn write_file<S, B, E>(
        &mut self,
        name: &str,
        stream: S,
        token: &CancelToken,
    ) -> Result<PathBuf, TransferError>
    where
        S: Stream<Item = Result<B, E>>,
        B: AsRef<[u8]>,
        E: Display,
    {
        let relative = sanitize_relative_path(name)?;
        let target = self.dir.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::io(parent, e))?;
        }
        let file = File::create(&target)
            .await
            .map_err(|e| TransferError::io(&target, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = std::pin::pin!(stream);

        loop {
            let next = tokio::select! {
                biased;
                () = token.cancelled() => return Err(TransferError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| TransferError::Upload {
                message: e.to_string(),
            })?;
            let bytes = chunk.as_ref();
            let len = bytes.len() as u64;
            if self.written.saturating_add(len) > self.limit {
                drop(writer);
                remove_quietly(&target).await;
                return Err(TransferError::LimitExceeded { limit: self.limit });
            }
            writer
                .write_all(bytes)
                .await
                .map_err(|e| TransferError::io(&target, e))?;
            self.written += len;
        }

        writer
            .flush()
            .await
            .map_err(|e| TransferError::io(&target, e))?;
        debug!(path = %relative.display(), total = self.written, "uploaded file written");
        self.files.push(target.clone());
        Ok(target)
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(error) = tokio::fs::remove_file(path).await {
        debug!(path = %path.display(), error = %error, "could not remove rejected upload");
    }
}
