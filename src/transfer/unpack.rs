//! Archive detection and extraction with external tools.
//!
//! Landed files are unpacked in place next to the archive, which is deleted
//! once its tool exits successfully. Tarballs from a single download lose
//! their leading directory so the contents land directly in the entry
//! directory; archives found later by the recursive sweep keep their layout.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument};
use walkdir::WalkDir;

use super::process::run_tool;
use super::{CancelToken, TransferError};

const TAR_SUFFIXES: [&str; 7] = [
    ".tar", ".tar.gz", ".tgz", ".tar.bz2", ".tbz2", ".tar.xz", ".txz",
];

/// Archive formats the pipeline knows how to unpack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    /// `.tar`, `.tar.gz`, `.tgz`, `.tar.bz2`, `.tbz2`, `.tar.xz`, `.txz`
    Tar,
    /// `.zip`
    Zip,
    /// Single-file `.gz`
    Gzip,
    /// Single-file `.bz2`
    Bzip2,
    /// Single-file `.xz`
    Xz,
}

impl ArchiveKind {
    /// Detects the archive kind from the file name, case-insensitively.
    #[must_use]
    pub fn detect(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?.to_ascii_lowercase();
        if TAR_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
            Some(Self::Tar)
        } else if name.ends_with(".zip") {
            Some(Self::Zip)
        } else if name.ends_with(".gz") {
            Some(Self::Gzip)
        } else if name.ends_with(".bz2") {
            Some(Self::Bzip2)
        } else if name.ends_with(".xz") {
            Some(Self::Xz)
        } else {
            None
        }
    }

    /// The external program handling this kind.
    #[must_use]
    pub fn program(self) -> &'static str {
        match self {
            Self::Tar => "tar",
            Self::Zip => "unzip",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
        }
    }
}

/// Unpacks one archive next to itself and deletes it.
///
/// Returns `Ok(false)` when the file is not a recognised archive.
/// `strip_leading` removes the first path component of tar members.
///
/// # Errors
///
/// Returns a process error if the tool fails (the archive is kept), an IO
/// error if the archive cannot be removed, or `Cancelled`.
#[instrument(skip(token), fields(path = %path.display()))]
pub async fn unpack_file(
    path: &Path,
    strip_leading: bool,
    token: &CancelToken,
) -> Result<bool, TransferError> {
    let Some(kind) = ArchiveKind::detect(path) else {
        return Ok(false);
    };
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let program = kind.program();

    match kind {
        ArchiveKind::Tar => {
            let mut args: Vec<&OsStr> = vec![
                OsStr::new("-xf"),
                path.as_os_str(),
                OsStr::new("-C"),
                parent.as_os_str(),
            ];
            if strip_leading {
                args.push(OsStr::new("--strip-components=1"));
            }
            run_tool(program, args, None, token).await?;
        }
        ArchiveKind::Zip => {
            run_tool(
                program,
                [
                    OsStr::new("-o"),
                    OsStr::new("-q"),
                    path.as_os_str(),
                    OsStr::new("-d"),
                    parent.as_os_str(),
                ],
                None,
                token,
            )
            .await?;
        }
        ArchiveKind::Gzip | ArchiveKind::Bzip2 | ArchiveKind::Xz => {
            run_tool(
                program,
                [OsStr::new("-d"), OsStr::new("-f"), path.as_os_str()],
                None,
                token,
            )
            .await?;
        }
    }

    // Single-file decompressors remove their input themselves.
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(TransferError::io(path, e)),
    }
    info!(kind = program, "archive unpacked");
    Ok(true)
}

/// Recursively unpacks every archive below `dir`.
///
/// The walk checks the token before each file and stops as soon as it fires.
/// Returns the number of archives unpacked.
///
/// # Errors
///
/// Returns the first unpack failure, or `Cancelled`.
#[instrument(skip(token), fields(dir = %dir.display()))]
pub async fn sweep(dir: &Path, token: &CancelToken) -> Result<usize, TransferError> {
    sweep_with(dir, token, |_| {}).await
}

async fn sweep_with(
    dir: &Path,
    token: &CancelToken,
    mut on_unpacked: impl FnMut(&Path),
) -> Result<usize, TransferError> {
    let root = dir.to_path_buf();
    let candidates = tokio::task::spawn_blocking(move || collect_archives(&root))
        .await
        .unwrap_or_default();

    let mut unpacked = 0;
    for path in candidates {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        if unpack_file(&path, false, token).await? {
            unpacked += 1;
            on_unpacked(&path);
        }
    }
    debug!(unpacked, "sweep finished");
    Ok(unpacked)
}

fn collect_archives(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| ArchiveKind::detect(path).is_some())
        .collect()
}
