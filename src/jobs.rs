//! Registry of running transfers.
//!
//! At most one [`Job`] exists per [`EntryKey`]. Registration goes through the
//! map's entry API so two concurrent fetches of the same entry cannot both
//! succeed. Each job carries a generation id; terminal callbacks pass it back
//! to [`JobRegistry::finish`] and are ignored when a newer job has replaced
//! theirs.
//!
//! Registration hands out a [`JobGuard`]. Whoever does the work holds it, and
//! dropping it unfinished releases the job, so an abandoned request never
//! leaves a job behind. The guard's end is observable through
//! [`Job::finished`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::catalog::{EntryKey, now_millis};
use crate::transfer::CancelToken;

/// A registered, cancellable unit of work for one entry.
#[derive(Debug, Clone)]
pub struct Job {
    /// Generation id, unique within the process.
    pub id: u64,
    /// Cancellation token shared with every step of the transfer.
    pub token: CancelToken,
    /// Human-readable description for logs and stats.
    pub description: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub started_at: u64,
    done: watch::Receiver<()>,
}

impl Job {
    /// Resolves once the job's guard is gone, meaning no work runs for it.
    pub async fn finished(&self) {
        let mut done = self.done.clone();
        while done.changed().await.is_ok() {}
    }
}

/// Ownership of a registered job.
///
/// Dropping the guard without [`finish`](Self::finish) removes the job from
/// the registry if it is still current.
#[derive(Debug)]
pub struct JobGuard {
    registry: Arc<JobRegistry>,
    key: EntryKey,
    job: Job,
    active: bool,
    _done: watch::Sender<()>,
}

impl JobGuard {
    /// The guarded job.
    #[must_use]
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// The job's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancelToken {
        &self.job.token
    }

    /// Ends the job; see [`JobRegistry::finish`].
    pub fn finish(mut self) -> bool {
        self.active = false;
        self.registry.finish(&self.key, self.job.id)
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.active && self.registry.finish(&self.key, self.job.id) {
            debug!(entry = %self.key, job = self.job.id, "abandoned job released");
        }
    }
}

/// Serializable view of a job for API responses.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    /// `user/source/id`.
    pub entry: String,
    /// Generation id.
    pub id: u64,
    /// Human-readable description.
    pub description: String,
    /// Registration time, milliseconds since the Unix epoch.
    pub started_at: u64,
}

/// Concurrent map of entry keys to jobs.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: DashMap<EntryKey, Job>,
    next_id: AtomicU64,
}

impl JobRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn new_guard(self: &Arc<Self>, key: &EntryKey, description: &str) -> JobGuard {
        let (sender, receiver) = watch::channel(());
        let job = Job {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            token: CancelToken::new(),
            description: description.to_string(),
            started_at: now_millis(),
            done: receiver,
        };
        JobGuard {
            registry: Arc::clone(self),
            key: key.clone(),
            job,
            active: true,
            _done: sender,
        }
    }

    /// Registers a job unless one already exists for `key`.
    ///
    /// Returns the new job's guard, or `None` when the key is already busy.
    pub fn try_add(self: &Arc<Self>, key: &EntryKey, description: &str) -> Option<JobGuard> {
        match self.jobs.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let guard = self.new_guard(key, description);
                slot.insert(guard.job().clone());
                debug!(entry = %key, job = guard.job().id, "job registered");
                Some(guard)
            }
        }
    }

    /// Registers a job, cancelling and replacing any existing one.
    ///
    /// Returns the new job's guard and the cancelled job, if there was one.
    pub fn replace(self: &Arc<Self>, key: &EntryKey, description: &str) -> (JobGuard, Option<Job>) {
        let guard = self.new_guard(key, description);
        let previous = self.jobs.insert(key.clone(), guard.job().clone());
        if let Some(previous) = &previous {
            previous.token.cancel();
            debug!(entry = %key, old = previous.id, new = guard.job().id, "job replaced");
        }
        (guard, previous)
    }

    /// Returns a copy of the job for `key`.
    #[must_use]
    pub fn get(&self, key: &EntryKey) -> Option<Job> {
        self.jobs.get(key).map(|job| job.value().clone())
    }

    /// Returns true if a job is registered for `key`.
    #[must_use]
    pub fn contains(&self, key: &EntryKey) -> bool {
        self.jobs.contains_key(key)
    }

    /// Cancels and removes the job for `key`, returning it.
    pub fn remove(&self, key: &EntryKey) -> Option<Job> {
        let (_, job) = self.jobs.remove(key)?;
        job.token.cancel();
        debug!(entry = %key, job = job.id, "job cancelled");
        Some(job)
    }

    /// Removes the job for `key` only if it is generation `id`.
    ///
    /// Returns true when the caller's job was still current, meaning the
    /// caller may write the terminal state of the entry.
    pub fn finish(&self, key: &EntryKey, id: u64) -> bool {
        self.jobs.remove_if(key, |_, job| job.id == id).is_some()
    }

    /// Number of registered jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no jobs are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Snapshot of all jobs, ordered by entry.
    #[must_use]
    pub fn list(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self
            .jobs
            .iter()
            .map(|item| JobInfo {
                entry: item.key().to_string(),
                id: item.value().id,
                description: item.value().description.clone(),
                started_at: item.value().started_at,
            })
            .collect();
        jobs.sort_by(|a, b| a.entry.cmp(&b.entry));
        jobs
    }

    /// Cancels every job (used at shutdown).
    pub fn cancel_all(&self) {
        for item in &self.jobs {
            item.value().token.cancel();
        }
    }
}
