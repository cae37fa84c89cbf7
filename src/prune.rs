//! Storage reclamation.
//!
//! Runs on a timer and once at startup, never per request. Two phases:
//!
//! 1. Managed entries. Unpinned entries that are not in progress are evicted
//!    when older than the age cutoff. If free space is still below the
//!    minimum, the remaining candidates are evicted oldest first until the
//!    shortfall is covered.
//! 2. Unmanaged data. Inside `user/source` directories with no catalog
//!    entries at all, individual files older than the age cutoff are deleted.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

use crate::catalog::recovery::disk_usage;
use crate::catalog::{
    CatalogError, DataEntry, EntryStatus, LocalCatalog, list_subdirs, now_millis,
};

const GIB: u64 = 1024 * 1024 * 1024;
const DAY_MILLIS: u64 = 24 * 60 * 60 * 1000;

/// Thresholds for one reclamation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrunePolicy {
    /// Free space to keep on the data volume, in GiB (0 disables).
    pub min_free_gb: u64,
    /// Maximum age of unpinned entries and stray files, in days (0 disables).
    pub max_age_days: u64,
}

impl PrunePolicy {
    fn min_free_bytes(self) -> u64 {
        self.min_free_gb.saturating_mul(GIB)
    }

    /// Cutoff in epoch milliseconds, or `None` when age eviction is off.
    fn cutoff_millis(self, now: u64) -> Option<u64> {
        (self.max_age_days > 0).then(|| now.saturating_sub(self.max_age_days.saturating_mul(DAY_MILLIS)))
    }
}

/// What one run removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    /// Entries evicted for age.
    pub removed_by_age: Vec<String>,
    /// Entries evicted for free space.
    pub removed_by_space: Vec<String>,
    /// Bytes freed by entry evictions.
    pub bytes_reclaimed: u64,
    /// Stray files deleted from unmanaged directories.
    pub stray_files_removed: usize,
}

/// Runs both phases against the real free space of the data volume.
///
/// # Errors
///
/// Returns the first catalog error from an eviction or directory listing.
pub async fn prune(catalog: &LocalCatalog, policy: PrunePolicy) -> Result<PruneReport, CatalogError> {
    prune_with(catalog, policy, |path| fs2::available_space(path)).await
}

/// Runs both phases, asking `available_space` for the free bytes on the
/// volume holding the data directory.
///
/// # Errors
///
/// Returns the first catalog error from an eviction or directory listing.
#[instrument(skip(catalog, available_space))]
pub async fn prune_with<F>(
    catalog: &LocalCatalog,
    policy: PrunePolicy,
    available_space: F,
) -> Result<PruneReport, CatalogError>
where
    F: Fn(&Path) -> io::Result<u64>,
{
    let mut report = PruneReport::default();
    let now = now_millis();
    let cutoff = policy.cutoff_millis(now);

    let mut candidates: Vec<DataEntry> = catalog
        .entries()
        .into_iter()
        .filter(is_evictable)
        .collect();

    if let Some(cutoff) = cutoff {
        let (expired, fresh): (Vec<_>, Vec<_>) =
            candidates.into_iter().partition(|e| e.updated < cutoff);
        candidates = fresh;
        for entry in expired {
            if let Some(bytes) = evict(catalog, &entry).await? {
                report.bytes_reclaimed += bytes;
                report.removed_by_age.push(entry_label(&entry));
            }
        }
    }

    let min_free = policy.min_free_bytes();
    if min_free > 0 {
        let data_dir = catalog.data_dir();
        match available_space(data_dir) {
            Ok(available) if available >= min_free => {
                debug!(available, min_free, "enough free space");
            }
            Ok(available) => {
                let mut shortfall = min_free - available;
                candidates.sort_by_key(|e| e.updated);
                for entry in candidates {
                    if shortfall == 0 {
                        break;
                    }
                    if let Some(bytes) = evict(catalog, &entry).await? {
                        shortfall = shortfall.saturating_sub(bytes);
                        report.bytes_reclaimed += bytes;
                        report.removed_by_space.push(entry_label(&entry));
                    }
                }
                if shortfall > 0 {
                    warn!(shortfall, "free space still below minimum after eviction");
                }
            }
            Err(error) => {
                warn!(path = %data_dir.display(), error = %error, "could not read free space");
            }
        }
    }

    if let Some(cutoff) = cutoff {
        report.stray_files_removed = prune_unmanaged(catalog, cutoff).await?;
    }

    info!(
        by_age = report.removed_by_age.len(),
        by_space = report.removed_by_space.len(),
        bytes = report.bytes_reclaimed,
        stray_files = report.stray_files_removed,
        "prune finished"
    );
    Ok(report)
}

fn is_evictable(entry: &DataEntry) -> bool {
    !entry.in_use && entry.status != EntryStatus::InProgress
}

fn entry_label(entry: &DataEntry) -> String {
    format!("{}/{}/{}", entry.user, entry.source, entry.id)
}

/// Removes `entry` if it is still evictable; returns the bytes it occupied.
async fn evict(catalog: &LocalCatalog, entry: &DataEntry) -> Result<Option<u64>, CatalogError> {
    let key = entry.key()?;
    let bytes = disk_usage(&catalog.entry_dir(&key)).await;
    if catalog.remove_entry_if(&key, is_evictable).await? {
        debug!(entry = %key, bytes, "entry evicted");
        Ok(Some(bytes))
    } else {
        Ok(None)
    }
}

/// Deletes old files below `user/source` directories that have no entries.
async fn prune_unmanaged(catalog: &LocalCatalog, cutoff_millis: u64) -> Result<usize, CatalogError> {
    let data_dir = catalog.data_dir().to_path_buf();
    let managed: Vec<(String, String)> = catalog
        .entries()
        .into_iter()
        .map(|e| (e.user, e.source))
        .collect();
    let cutoff = SystemTime::UNIX_EPOCH + Duration::from_millis(cutoff_millis);

    let mut unmanaged: Vec<PathBuf> = Vec::new();
    for user in list_subdirs(&data_dir).await? {
        for source in list_subdirs(&data_dir.join(&user)).await? {
            let has_entries = managed.iter().any(|(u, s)| *u == user && *s == source);
            if !has_entries {
                unmanaged.push(data_dir.join(&user).join(&source));
            }
        }
    }
    if unmanaged.is_empty() {
        return Ok(0);
    }

    let removed = tokio::task::spawn_blocking(move || {
        unmanaged
            .iter()
            .map(|dir| remove_old_files(dir, cutoff))
            .sum::<usize>()
    })
    .await
    .unwrap_or(0);
    Ok(removed)
}

fn remove_old_files(dir: &Path, cutoff: SystemTime) -> usize {
    let mut removed = 0;
    for entry in WalkDir::new(dir).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let modified = entry.metadata().ok().and_then(|m| m.modified().ok());
        if modified.is_some_and(|m| m < cutoff) {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(error) => {
                    warn!(path = %entry.path().display(), error = %error, "could not delete stray file");
                }
            }
        }
    }
    removed
}
