//! Rebuilding catalog records from what is on disk.

use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use super::store::list_subdirs;
use super::{CatalogError, EntryKey};

/// One entry directory found while scanning a user directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundEntry {
    /// Key derived from the directory names.
    pub key: EntryKey,
    /// Total size of regular files below the directory.
    pub size: u64,
}

/// Total size in bytes of the regular files below `path`.
///
/// Unreadable entries are skipped; a missing path has size zero.
pub async fn disk_usage(path: &Path) -> u64 {
    let root = path.to_path_buf();
    tokio::task::spawn_blocking(move || disk_usage_blocking(&root))
        .await
        .unwrap_or(0)
}

fn disk_usage_blocking(root: &Path) -> u64 {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Lists `<data_dir>/<user>/<source>/<id>` directories with their sizes.
///
/// Directories whose names are not valid entry key components are ignored.
///
/// # Errors
///
/// Returns an IO error if a directory level cannot be listed.
pub async fn scan_user_dir(data_dir: &Path, user: &str) -> Result<Vec<FoundEntry>, CatalogError> {
    let user_dir: PathBuf = data_dir.join(user);
    let mut found = Vec::new();
    for source in list_subdirs(&user_dir).await? {
        let source_dir = user_dir.join(&source);
        for id in list_subdirs(&source_dir).await? {
            let Ok(key) = EntryKey::new(user, &source, &id) else {
                debug!(user, source = %source, id = %id, "skipping directory with invalid name");
                continue;
            };
            let size = disk_usage(&source_dir.join(&id)).await;
            found.push(FoundEntry { key, size });
        }
    }
    Ok(found)
}
